//! Host path <-> sandbox path translation for drive mounts (`C:\x` <-> `/mnt/c/x`).

/// Translate a host drive path into its mount path inside a sandbox.
///
/// Returns `None` for paths without a drive letter (UNC shares, relative paths).
pub fn to_sandbox_path(host_path: &str) -> Option<String> {
    let mut chars = host_path.chars();
    let drive = chars.next()?;
    if !drive.is_ascii_alphabetic() || chars.next()? != ':' {
        return None;
    }
    let rest: String = chars.collect::<String>().replace('\\', "/");
    let rest = rest.trim_start_matches('/').trim_end_matches('/');

    let mut out = format!("/mnt/{}", drive.to_ascii_lowercase());
    if !rest.is_empty() {
        out.push('/');
        out.push_str(rest);
    }
    Some(out)
}

/// Translate a `/mnt/<drive>/...` sandbox path back into a host drive path.
pub fn to_host_path(sandbox_path: &str) -> Option<String> {
    let rest = sandbox_path.strip_prefix("/mnt/")?;
    let mut parts = rest.splitn(2, '/');
    let drive = parts.next()?;
    if drive.len() != 1 || !drive.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    let tail = parts.next().unwrap_or("").trim_end_matches('/');

    let mut out = format!("{}:\\", drive.to_ascii_uppercase());
    out.push_str(&tail.replace('/', "\\"));
    Some(out)
}

/// Whether a sandbox path lives on a host drive mount.
pub fn is_mount_path(sandbox_path: &str) -> bool {
    to_host_path(sandbox_path).is_some()
}
