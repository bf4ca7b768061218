/// Log a warning, and if a debug build then panic.
///
/// Used for internal inconsistencies between the socket layer and the transport that indicate a
/// bug, but that a release build can survive by dropping the offending event.
macro_rules! debug_panic {
    ($($x:tt)+) => {
        log::warn!($($x)+);
        #[cfg(debug_assertions)]
        panic!($($x)+);
    };
}

/// Return `Err(errno)` after logging the failed operation at trace level.
macro_rules! fail_with {
    ($errno:expr, $($x:tt)+) => {{
        log::trace!($($x)+);
        return Err($errno);
    }};
}

#[cfg(test)]
mod tests {
    use nix::errno::Errno;

    // will panic in debug mode
    #[test]
    #[cfg(debug_assertions)]
    #[should_panic]
    fn debug_panic_macro() {
        debug_panic!("Unknown connection {}", 7);
    }

    // will *not* panic in release mode
    #[test]
    #[cfg(not(debug_assertions))]
    fn debug_panic_macro() {
        debug_panic!("Unknown connection {}", 7);
    }

    fn fails(fd: u32) -> Result<(), Errno> {
        if fd > 3 {
            fail_with!(Errno::EBADF, "No socket {fd}");
        }
        Ok(())
    }

    #[test]
    fn fail_with_macro() {
        assert_eq!(fails(1), Ok(()));
        assert_eq!(fails(4), Err(Errno::EBADF));
    }
}
