//! Who's taking this backup? Stamped into snapshots, keys, and locks.

/// Best-effort hostname; cloud runners without one get a placeholder.
pub fn hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| String::from("localhost"))
}

pub fn username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default()
}

#[cfg(unix)]
pub fn uid_gid() -> (u32, u32) {
    (
        rustix::process::getuid().as_raw(),
        rustix::process::getgid().as_raw(),
    )
}

#[cfg(not(unix))]
pub fn uid_gid() -> (u32, u32) {
    (0, 0)
}
