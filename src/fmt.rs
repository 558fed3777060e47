#![macro_use]
#![allow(unused)]

//! Log macros. They forward to `defmt` when the feature is on and otherwise only borrow
//! their arguments, so both builds see the same expressions used.

#[allow(unused_macros)]
#[collapse_debuginfo(yes)]
macro_rules! log_at {
    ($level:ident, $s:literal $(, $x:expr)* $(,)?) => {
        {
            #[cfg(feature = "defmt")]
            ::defmt::$level!($s $(, $x)*);
            #[cfg(not(feature = "defmt"))]
            let _ = ($( & $x ),*);
        }
    };
}

#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => { log_at!(trace, $($arg)*) };
}

#[allow(unused_macros)]
macro_rules! debug {
    ($($arg:tt)*) => { log_at!(debug, $($arg)*) };
}

#[allow(unused_macros)]
macro_rules! info {
    ($($arg:tt)*) => { log_at!(info, $($arg)*) };
}

#[allow(unused_macros)]
macro_rules! warn {
    ($($arg:tt)*) => { log_at!(warn, $($arg)*) };
}

#[allow(unused_macros)]
macro_rules! error {
    ($($arg:tt)*) => { log_at!(error, $($arg)*) };
}
