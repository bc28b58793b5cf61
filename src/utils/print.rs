//! Helper macros for logging (console printing).

use env_logger::Env;

/// Log TRACE message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_trace!(self.name; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_trace {
    ($prefix:expr; $($fmt_args:tt)*) => {
        log::trace!("({}) {}", $prefix, format!($($fmt_args)*))
    };
}

/// Log DEBUG message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_debug!(self.name; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_debug {
    ($prefix:expr; $($fmt_args:tt)*) => {
        log::debug!("({}) {}", $prefix, format!($($fmt_args)*))
    };
}

/// Log INFO message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_info!(self.name; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_info {
    ($prefix:expr; $($fmt_args:tt)*) => {
        log::info!("({}) {}", $prefix, format!($($fmt_args)*))
    };
}

/// Log WARN message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_warn!(self.name; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_warn {
    ($prefix:expr; $($fmt_args:tt)*) => {
        log::warn!("({}) {}", $prefix, format!($($fmt_args)*))
    };
}

/// Log ERROR message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_error!(self.name; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_error {
    ($prefix:expr; $($fmt_args:tt)*) => {
        log::error!("({}) {}", $prefix, format!($($fmt_args)*))
    };
}

/// Initialize `env_logger` to desired configuration if haven't.
pub fn logger_init() {
    let _ =
        env_logger::Builder::from_env(Env::default().default_filter_or("info"))
            .format_timestamp(None)
            .format_module_path(false)
            .format_target(false)
            .try_init();
}

/// Log an error string to logger and then return a `ReplogError`
/// containing the string.
///
/// Example:
/// ```no_compile
/// let e = logged_err!(self.name; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! logged_err {
    ($prefix:expr; $($fmt_args:tt)*) => {
        {
            pf_error!($prefix; $($fmt_args)*);
            Err($crate::ReplogError::msg(format!($($fmt_args)*)))
        }
    };
}
