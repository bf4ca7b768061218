pub mod emu_logger;
