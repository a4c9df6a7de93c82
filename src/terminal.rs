#[cfg(unix)]
pub fn stderr_is_tty() -> bool {
    unsafe {
        libc::isatty(/* stderr */ 2) == 1
    }
}

#[cfg(not(unix))]
pub fn stderr_is_tty() -> bool {
    false
}
