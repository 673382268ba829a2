use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tracing::{debug, warn};
use uuid::Uuid;

use docbridge_protocol::wellknown;

/// One chroot jail: a random directory under the child root, populated
/// from the system template plus the engine install.
pub struct Jail {
    pub id: String,
    pub path: PathBuf,
}

impl Jail {
    /// Removes the jail tree. Best effort; a busy mount or open file
    /// just leaves debris for the next sweep.
    pub fn remove(&self) {
        if let Err(err) = fs::remove_dir_all(&self.path) {
            warn!(jail = %self.id, "jail cleanup failed: {}", err);
        }
    }
}

/// Builds a jail: copies the system template, mirrors the engine install
/// under the configured subpath via hard links, creates `user/docs` for
/// hosted documents, and wires up both control pipes. The shared reply
/// FIFO is hard-linked in, so every jail writes to the same inode.
pub fn create_jail(
    child_root: &Path,
    lo_subpath: &str,
    systemplate: Option<&Path>,
    lotemplate: Option<&Path>,
    reply_fifo: &Path,
) -> Result<Jail> {
    let id = Uuid::new_v4().simple().to_string();
    let path = child_root.join(&id);
    fs::create_dir_all(&path).with_context(|| format!("creating jail {}", path.display()))?;

    if let Some(template) = systemplate {
        link_or_copy_tree(template, &path)
            .with_context(|| format!("populating jail from {}", template.display()))?;
    }

    let engine_root = path.join(lo_subpath);
    if let Some(template) = lotemplate {
        link_or_copy_tree(template, &engine_root)
            .with_context(|| format!("mirroring engine from {}", template.display()))?;
    }
    fs::create_dir_all(engine_root.join("program")).context("creating engine program dir")?;

    fs::create_dir_all(path.join("user").join("docs")).context("creating user/docs")?;
    fs::create_dir_all(path.join("tmp")).context("creating tmp")?;

    let fifo_name = Path::new(wellknown::BROKER_REPLY_FIFO)
        .file_name()
        .context("reply fifo name")?;
    fs::hard_link(reply_fifo, path.join("tmp").join(fifo_name))
        .with_context(|| format!("linking reply fifo into jail {}", id))?;

    mkfifo(
        &path.join(
            Path::new(wellknown::WORKER_REQUEST_PIPE)
                .strip_prefix("/")
                .unwrap_or(Path::new("pipe")),
        ),
        Mode::S_IRUSR | Mode::S_IWUSR,
    )
    .context("creating worker request pipe")?;

    debug!(jail = %id, path = %path.display(), "jail created");
    Ok(Jail { id, path })
}

/// Mirrors a directory tree with hard links, falling back to copies
/// across filesystems. Symlinks are recreated as symlinks.
fn link_or_copy_tree(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            link_or_copy_tree(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            if !target.exists() {
                std::os::unix::fs::symlink(link, &target)?;
            }
        } else if !target.exists() && fs::hard_link(entry.path(), &target).is_err() {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("copying {}", entry.path().display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jail_has_docs_pipes_and_engine_dir() {
        let root = tempfile::tempdir().unwrap();
        let fifo = root.path().join("broker.fifo");
        mkfifo(&fifo, Mode::S_IRUSR | Mode::S_IWUSR).unwrap();

        let jail = create_jail(root.path(), "lo", None, None, &fifo).unwrap();
        assert!(jail.path.join("user/docs").is_dir());
        assert!(jail.path.join("lo/program").is_dir());
        assert!(jail.path.join("pipe").exists());
        assert!(jail.path.join("tmp/docbridge-broker.fifo").exists());

        jail.remove();
        assert!(!jail.path.exists());
    }

    #[test]
    fn template_tree_is_mirrored() {
        let root = tempfile::tempdir().unwrap();
        let fifo = root.path().join("broker.fifo");
        mkfifo(&fifo, Mode::S_IRUSR | Mode::S_IWUSR).unwrap();

        let template = root.path().join("systemplate");
        fs::create_dir_all(template.join("etc")).unwrap();
        fs::write(template.join("etc/hosts"), "127.0.0.1 localhost\n").unwrap();

        let jail = create_jail(root.path(), "lo", Some(&template), None, &fifo).unwrap();
        let mirrored = fs::read_to_string(jail.path.join("etc/hosts")).unwrap();
        assert_eq!(mirrored, "127.0.0.1 localhost\n");
    }
}
