//! Mount table and propagation inspection
//!
//! Reads `/proc/mounts` and `/proc/self/mountinfo` with a consistency check
//! (the kernel may change the table between individual reads), detects mount
//! points by device id, and makes directories recursively shared.

use super::{Exec, MountPoint};
use crate::error::{Error, Result};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info};

// =============================================================================
// Constants
// =============================================================================

pub const PROC_MOUNTS_PATH: &str = "/proc/mounts";
pub const PROC_MOUNTINFO_PATH: &str = "/proc/self/mountinfo";

/// Number of re-reads before giving up on a stable snapshot
pub const MAX_LIST_TRIES: usize = 3;

/// Fields per `/proc/mounts` line
const EXPECTED_NUM_FIELDS_PER_LINE: usize = 6;

/// Minimum fields per mountinfo line
const MIN_MOUNTINFO_FIELDS: usize = 7;

// =============================================================================
// Mount Info
// =============================================================================

/// One line of the extended mount-info table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub root: String,
    pub mount_point: String,
    /// Optional fields up to the `-` separator (`shared:N`, `master:N`, ...)
    pub optional: Vec<String>,
}

impl MountInfo {
    pub fn is_shared(&self) -> bool {
        self.optional.iter().any(|o| o.starts_with("shared:"))
    }
}

// =============================================================================
// Inspector
// =============================================================================

/// Reads kernel mount tables; paths are overridable for testing
#[derive(Debug, Clone)]
pub struct MountPropagationInspector {
    mounts_path: PathBuf,
    mountinfo_path: PathBuf,
}

impl Default for MountPropagationInspector {
    fn default() -> Self {
        Self::new(PROC_MOUNTS_PATH, PROC_MOUNTINFO_PATH)
    }
}

impl MountPropagationInspector {
    pub fn new(mounts_path: impl Into<PathBuf>, mountinfo_path: impl Into<PathBuf>) -> Self {
        Self {
            mounts_path: mounts_path.into(),
            mountinfo_path: mountinfo_path.into(),
        }
    }

    /// Consistent snapshot of the mount table
    pub fn list(&self) -> Result<Vec<MountPoint>> {
        let path = &self.mounts_path;
        list_mounts_with(|| std::fs::read_to_string(path), &path.to_string_lossy())
    }

    /// Consistent snapshot of the mount-info table
    pub fn mount_info(&self) -> Result<Vec<MountInfo>> {
        let path = &self.mountinfo_path;
        mount_info_with(|| std::fs::read_to_string(path), &path.to_string_lossy())
    }

    /// Whether `path` is not a mount point, by comparing its device id with
    /// its parent's. Bind mounts within one device are not detected.
    pub fn is_not_mount_point(&self, path: &Path) -> Result<bool> {
        let st = nix::sys::stat::stat(path).map_err(std::io::Error::from)?;
        let parent = nix::sys::stat::lstat(&path.join("..")).map_err(std::io::Error::from)?;
        // Differing devices mean a mount boundary
        Ok(st.st_dev == parent.st_dev)
    }

    /// Whether the mount holding `path` has shared propagation
    pub fn is_shared(&self, path: &Path) -> Result<bool> {
        let infos = self.mount_info()?;
        let info = find_mount_info(&infos, path).ok_or_else(|| Error::MountPointNotFound {
            path: path.to_string_lossy().into_owned(),
        })?;
        Ok(info.is_shared())
    }

    /// Bind-mount `path` onto itself and mark it rshared, unless already shared
    ///
    /// `mount_command` is the command prefix (`["mount"]`, or a containerized
    /// mounter followed by `"mount"`).
    pub async fn make_shared(
        &self,
        path: &Path,
        exec: &dyn Exec,
        mount_command: &[String],
        timeout: Duration,
    ) -> Result<()> {
        if self.is_shared(path)? {
            debug!("Directory {:?} is already on a shared mount", path);
            return Ok(());
        }

        let Some((program, prefix)) = mount_command.split_first() else {
            return Err(Error::Configuration("empty mount command".into()));
        };
        let target = path.to_string_lossy().into_owned();

        info!("Bind-mounting {:?} with shared mount propagation", path);
        let mut bind_args = prefix.to_vec();
        bind_args.extend(["--bind".to_string(), target.clone(), target.clone()]);
        run_mount_step(exec, program, bind_args, timeout).await?;

        let mut shared_args = prefix.to_vec();
        shared_args.extend(["--make-rshared".to_string(), target]);
        run_mount_step(exec, program, shared_args, timeout).await
    }
}

async fn run_mount_step(
    exec: &dyn Exec,
    program: &str,
    args: Vec<String>,
    timeout: Duration,
) -> Result<()> {
    let result = exec.run(program, &args, timeout).await?;
    if result.success() {
        return Ok(());
    }
    let output = result.combined_output();
    error!(
        "Mount step failed: {} {:?}, exit code {}, output: {}",
        program, args, result.exit_code, output
    );
    Err(Error::MountFailed {
        command: program.to_string(),
        args,
        output,
        reason: format!("exit status {}", result.exit_code),
    })
}

/// Newest mount whose mount point is a path prefix of `path`
pub fn find_mount_info<'a>(infos: &'a [MountInfo], path: &Path) -> Option<&'a MountInfo> {
    infos
        .iter()
        .rev()
        .find(|info| path.starts_with(&info.mount_point))
}

// =============================================================================
// Snapshot Reading
// =============================================================================

/// Read the mount table through `read` until two consecutive reads hash equal
pub fn list_mounts_with<F>(mut read: F, path: &str) -> Result<Vec<MountPoint>>
where
    F: FnMut() -> std::io::Result<String>,
{
    let (mut previous, _) = parse_proc_mounts(&read()?, path)?;
    for _ in 0..MAX_LIST_TRIES {
        let (hash, mounts) = parse_proc_mounts(&read()?, path)?;
        if hash == previous {
            return Ok(mounts);
        }
        previous = hash;
    }
    Err(Error::InconsistentMountTable {
        path: path.to_string(),
        tries: MAX_LIST_TRIES,
    })
}

/// Read the mount-info table through `read` until two parses agree
pub fn mount_info_with<F>(mut read: F, path: &str) -> Result<Vec<MountInfo>>
where
    F: FnMut() -> std::io::Result<String>,
{
    let mut previous = parse_mount_info(&read()?, path)?;
    for _ in 0..MAX_LIST_TRIES {
        let current = parse_mount_info(&read()?, path)?;
        if current == previous {
            return Ok(current);
        }
        previous = current;
    }
    Err(Error::InconsistentMountTable {
        path: path.to_string(),
        tries: MAX_LIST_TRIES,
    })
}

/// Parse `/proc/mounts` content, returning a content hash and the entries
pub fn parse_proc_mounts(content: &str, path: &str) -> Result<(u64, Vec<MountPoint>)> {
    let mut hasher = DefaultHasher::new();
    let mut mounts = Vec::new();

    for line in content.lines() {
        line.hash(&mut hasher);
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != EXPECTED_NUM_FIELDS_PER_LINE {
            return Err(Error::MalformedMountTable {
                path: path.to_string(),
                reason: format!(
                    "wrong number of fields (expected {}, got {}): {}",
                    EXPECTED_NUM_FIELDS_PER_LINE,
                    fields.len(),
                    line
                ),
            });
        }
        mounts.push(MountPoint {
            device: fields[0].to_string(),
            path: PathBuf::from(fields[1]),
            fs_type: fields[2].to_string(),
            opts: fields[3].split(',').map(str::to_string).collect(),
            freq: parse_int_field(fields[4], path)?,
            pass: parse_int_field(fields[5], path)?,
        });
    }
    Ok((hasher.finish(), mounts))
}

/// Parse mountinfo content
pub fn parse_mount_info(content: &str, path: &str) -> Result<Vec<MountInfo>> {
    let mut infos = Vec::new();
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < MIN_MOUNTINFO_FIELDS {
            return Err(Error::MalformedMountTable {
                path: path.to_string(),
                reason: format!(
                    "wrong number of fields (expected at least {}, got {}): {}",
                    MIN_MOUNTINFO_FIELDS,
                    fields.len(),
                    line
                ),
            });
        }
        infos.push(MountInfo {
            root: fields[3].to_string(),
            mount_point: fields[4].to_string(),
            optional: fields[6..]
                .iter()
                .take_while(|f| **f != "-")
                .map(|f| f.to_string())
                .collect(),
        });
    }
    Ok(infos)
}

fn parse_int_field(value: &str, path: &str) -> Result<i32> {
    value.parse().map_err(|_| Error::MalformedMountTable {
        path: path.to_string(),
        reason: format!("expected integer, got {:?}", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeExec;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    const MOUNTS: &str = "\
/dev/sda1 / ext4 rw,relatime 0 0
tmpfs /run tmpfs rw,nosuid,nodev 0 0
/dev/sdb /var/lib/kubelet ext4 rw 0 1
";

    const MOUNTINFO: &str = "\
15 0 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
22 15 0:20 / /run rw,nosuid master:5 - tmpfs tmpfs rw
40 15 8:16 / /var/lib/kubelet rw - ext4 /dev/sdb rw
";

    #[test]
    fn test_parse_proc_mounts() {
        let (_, mounts) = parse_proc_mounts(MOUNTS, "mounts").unwrap();
        assert_eq!(mounts.len(), 3);
        assert_eq!(mounts[1].device, "tmpfs");
        assert_eq!(mounts[1].opts, vec!["rw", "nosuid", "nodev"]);
        assert_eq!(mounts[2].path, PathBuf::from("/var/lib/kubelet"));
        assert_eq!(mounts[2].pass, 1);
    }

    #[test]
    fn test_parse_rejects_wrong_field_count() {
        let result = parse_proc_mounts("/dev/sda1 / ext4 rw 0\n", "mounts");
        assert_matches!(result, Err(Error::MalformedMountTable { .. }));
    }

    #[test]
    fn test_stable_read_succeeds() {
        let mounts = list_mounts_with(|| Ok(MOUNTS.to_string()), "mounts").unwrap();
        assert_eq!(mounts.len(), 3);
    }

    #[test]
    fn test_settles_after_change() {
        let mut reads = 0;
        let mounts = list_mounts_with(
            || {
                reads += 1;
                if reads == 1 {
                    Ok("/dev/sda1 / ext4 rw 0 0\n".to_string())
                } else {
                    Ok(MOUNTS.to_string())
                }
            },
            "mounts",
        )
        .unwrap();
        assert_eq!(mounts.len(), 3);
        assert_eq!(reads, 3);
    }

    #[test]
    fn test_unstable_table_fails() {
        let mut reads = 0;
        let result = list_mounts_with(
            || {
                reads += 1;
                Ok(format!("tmpfs /tmp/{} tmpfs rw 0 0\n", reads))
            },
            "/proc/mounts",
        );
        assert_matches!(
            result,
            Err(Error::InconsistentMountTable { tries: MAX_LIST_TRIES, .. })
        );
        assert_eq!(reads, MAX_LIST_TRIES + 1);
    }

    #[test]
    fn test_parse_mount_info() {
        let infos = parse_mount_info(MOUNTINFO, "mountinfo").unwrap();
        assert_eq!(infos.len(), 3);
        assert_eq!(infos[0].optional, vec!["shared:1"]);
        assert_eq!(infos[1].optional, vec!["master:5"]);
        assert!(infos[2].optional.is_empty());
    }

    #[test]
    fn test_find_mount_info_prefers_newest() {
        let infos = parse_mount_info(MOUNTINFO, "mountinfo").unwrap();

        let info = find_mount_info(&infos, Path::new("/var/lib/kubelet/pods")).unwrap();
        assert_eq!(info.mount_point, "/var/lib/kubelet");
        assert!(!info.is_shared());

        let info = find_mount_info(&infos, Path::new("/var/lib/kubelet2")).unwrap();
        assert_eq!(info.mount_point, "/");
        assert!(info.is_shared());
    }

    #[test]
    fn test_is_shared_without_match_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let mountinfo = dir.path().join("mountinfo");
        std::fs::write(&mountinfo, "40 15 8:16 / /var/lib/kubelet rw - ext4 /dev/sdb rw\n").unwrap();

        let inspector = MountPropagationInspector::new(dir.path().join("mounts"), &mountinfo);
        let result = inspector.is_shared(Path::new("/srv/data"));
        assert_matches!(result, Err(Error::MountPointNotFound { .. }));
    }

    #[test]
    fn test_is_not_mount_point_for_plain_dir() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("plain");
        std::fs::create_dir(&sub).unwrap();

        let inspector = MountPropagationInspector::default();
        assert!(inspector.is_not_mount_point(&sub).unwrap());

        let err = inspector.is_not_mount_point(&dir.path().join("missing")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_make_shared_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mountinfo = dir.path().join("mountinfo");
        std::fs::write(&mountinfo, "40 15 8:16 / /var/lib/kubelet rw - ext4 /dev/sdb rw\n").unwrap();

        // The fake marks the mount shared once --make-rshared runs
        let info_path = mountinfo.clone();
        let exec = Arc::new(FakeExec::with_handler(move |_cmd, args| {
            if args.iter().any(|a| a == "--make-rshared") {
                std::fs::write(
                    &info_path,
                    "40 15 8:16 / /var/lib/kubelet rw - ext4 /dev/sdb rw\n\
                     41 40 8:16 / /var/lib/kubelet rw shared:7 - ext4 /dev/sdb rw\n",
                )
                .unwrap();
            }
            Default::default()
        }));

        let inspector = MountPropagationInspector::new(dir.path().join("mounts"), &mountinfo);
        let cmd = vec!["mount".to_string()];
        let target = Path::new("/var/lib/kubelet");

        inspector
            .make_shared(target, exec.as_ref(), &cmd, Duration::from_secs(5))
            .await
            .unwrap();
        inspector
            .make_shared(target, exec.as_ref(), &cmd, Duration::from_secs(5))
            .await
            .unwrap();

        let calls = exec.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[0].1,
            vec!["--bind", "/var/lib/kubelet", "/var/lib/kubelet"]
        );
        assert_eq!(calls[1].1, vec!["--make-rshared", "/var/lib/kubelet"]);
        assert!(inspector.is_shared(target).unwrap());
    }
}
