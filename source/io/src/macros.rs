#![allow(unused_macros)]

#[cfg(feature = "defmt-logging")]
macro_rules! io_log {
    (trace,   $($arg:expr),*) => { defmt::trace!($($arg),*) };
    (debug,   $($arg:expr),*) => { defmt::debug!($($arg),*) };
    (info,    $($arg:expr),*) => { defmt::info!($($arg),*) };
    (warn,    $($arg:expr),*) => { defmt::warn!($($arg),*) };
    (error,   $($arg:expr),*) => { defmt::error!($($arg),*) };
}

#[cfg(not(feature = "defmt-logging"))]
macro_rules! io_log {
    ($level:ident, $($arg:expr),*) => {{ $( let _ = $arg; )* }}
}

macro_rules! io_trace {
    ($($arg:expr),*) => (io_log!(trace, $($arg),*));
}

macro_rules! io_debug {
    ($($arg:expr),*) => (io_log!(debug, $($arg),*));
}

macro_rules! io_info {
    ($($arg:expr),*) => (io_log!(info, $($arg),*));
}

macro_rules! io_warn {
    ($($arg:expr),*) => (io_log!(warn, $($arg),*));
}

macro_rules! io_error {
    ($($arg:expr),*) => (io_log!(error, $($arg),*));
}
