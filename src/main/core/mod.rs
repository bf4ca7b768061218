pub mod configuration;
pub mod controller;
pub mod kernel;
pub mod logger;
pub mod main;
pub mod worker;
