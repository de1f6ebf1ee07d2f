//! Atomic content injection.
//!
//! Overrides of type `inject` guarantee that a live file contains a given
//! byte sequence.  The file may be rewritten at any moment by package
//! managers, so edits must never leave partial content visible: build a
//! sibling temp file, modify it, rename it over the original.

use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::BorrowedFd;
use std::os::unix::fs::FileExt;

use nix::errno::Errno;

use bedrock_core::io_errno;
use bedrock_root::at;

/// Sibling-file suffix used while atomically rewriting a target.
const ATOMIC_UPDATE_SUFFIX: &str = "-bedrock-backup";

fn errno_io(e: std::io::Error) -> Errno {
    io_errno(&e)
}

/// Whether the (possibly binary, possibly NUL-carrying) needle occurs in
/// the file.  Reads forward from the current offset in bounded chunks,
/// keeping a needle-sized overlap between reads.
pub fn file_search(file: &std::fs::File, needle: &[u8]) -> Result<bool, Errno> {
    Ok(find_in_file(file, needle)?.is_some())
}

/// Byte offset of the first occurrence of `needle`, if any.
pub fn find_in_file(file: &std::fs::File, needle: &[u8]) -> Result<Option<u64>, Errno> {
    if needle.is_empty() {
        return Ok(Some(0));
    }
    let chunk = needle.len().max(4096);
    let mut buf = vec![0u8; chunk + needle.len() - 1];
    let mut filled = 0usize;
    let mut consumed = 0u64;
    let mut reader = file;
    loop {
        let n = reader.read(&mut buf[filled..]).map_err(errno_io)?;
        if n == 0 {
            return Ok(None);
        }
        filled += n;
        if let Some(pos) = buf[..filled].windows(needle.len()).position(|w| w == needle) {
            return Ok(Some(consumed + pos as u64));
        }
        if filled >= needle.len() {
            let keep = needle.len() - 1;
            consumed += (filled - keep) as u64;
            buf.copy_within(filled - keep..filled, 0);
            filled = keep;
        }
    }
}

struct TempFile<'a> {
    ref_fd: BorrowedFd<'a>,
    name: String,
    file: std::fs::File,
}

impl<'a> TempFile<'a> {
    fn create(ref_fd: BorrowedFd<'a>, rpath: &str, mode: u32) -> Result<TempFile<'a>, Errno> {
        let name = format!("{rpath}{ATOMIC_UPDATE_SUFFIX}");
        let _ = at::unlinkat(ref_fd, &name, 0);
        let fd = at::openat(
            ref_fd,
            &name,
            libc::O_NONBLOCK | libc::O_CREAT | libc::O_RDWR | libc::O_NOFOLLOW,
            mode,
        )?;
        Ok(TempFile {
            ref_fd,
            name,
            file: std::fs::File::from(fd),
        })
    }

    /// Atomically replace `rpath` with the temp file's content.
    fn rename_over(&self, rpath: &str) -> Result<(), Errno> {
        at::renameat(self.ref_fd, &self.name, self.ref_fd, rpath)
    }
}

impl Drop for TempFile<'_> {
    fn drop(&mut self) {
        // After a successful rename nothing is left under the temp name
        // and this is a no-op.
        let _ = at::unlinkat(self.ref_fd, &self.name, 0);
    }
}

/// Ensure the file at `rpath` (relative to `ref_fd`) contains `content` as
/// a verbatim byte substring, appending it atomically when absent.
pub fn inject(ref_fd: BorrowedFd, rpath: &str, content: &[u8]) -> Result<(), Errno> {
    let fd = at::openat(ref_fd, rpath, libc::O_NONBLOCK | libc::O_RDONLY, 0)?;
    let mut file = std::fs::File::from(fd);
    let init_len = at::fstat(std::os::fd::AsFd::as_fd(&file))?.st_size as u64;

    // Some package managers sanity check that a file they created is still
    // empty before writing it.  Injecting between those steps breaks them,
    // so empty files are left alone.
    if init_len == 0 {
        return Ok(());
    }

    if init_len >= content.len() as u64 && file_search(&file, content)? {
        return Ok(());
    }

    let mode = at::fstat(std::os::fd::AsFd::as_fd(&file))?.st_mode & 0o7777;
    let mut tmp = TempFile::create(ref_fd, rpath, mode)?;
    file.seek(SeekFrom::Start(0)).map_err(errno_io)?;
    std::io::copy(&mut file, &mut tmp.file).map_err(errno_io)?;
    tmp.file.write_all(content).map_err(errno_io)?;
    tmp.rename_over(rpath)
}

/// Remove up to one occurrence of `content` from the file at `rpath`,
/// atomically.
pub fn uninject(ref_fd: BorrowedFd, rpath: &str, content: &[u8]) -> Result<(), Errno> {
    let fd = at::openat(ref_fd, rpath, libc::O_NONBLOCK | libc::O_RDONLY, 0)?;
    let mut file = std::fs::File::from(fd);
    let st = at::fstat(std::os::fd::AsFd::as_fd(&file))?;
    let init_len = st.st_size as u64;

    if init_len < content.len() as u64 {
        return Ok(());
    }

    let offset = match find_in_file(&file, content)? {
        Some(off) => off,
        None => return Ok(()),
    };

    // Copy the whole file, truncate to the target size, then shift the
    // post-match tail over the match region.
    let mut tmp = TempFile::create(ref_fd, rpath, st.st_mode & 0o7777)?;
    file.seek(SeekFrom::Start(0)).map_err(errno_io)?;
    std::io::copy(&mut file, &mut tmp.file).map_err(errno_io)?;
    tmp.file
        .set_len(init_len - content.len() as u64)
        .map_err(errno_io)?;

    let mut pos_src = offset + content.len() as u64;
    let mut pos_dst = offset;
    let mut buf = vec![0u8; 4096];
    loop {
        let n = file.read_at(&mut buf, pos_src).map_err(errno_io)?;
        if n == 0 {
            break;
        }
        tmp.file.write_all_at(&buf[..n], pos_dst).map_err(errno_io)?;
        pos_src += n as u64;
        pos_dst += n as u64;
    }

    tmp.rename_over(rpath)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;

    struct Fixture {
        dir: tempfile::TempDir,
        ref_file: std::fs::File,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let ref_file = std::fs::File::open(dir.path()).unwrap();
        Fixture { dir, ref_file }
    }

    impl Fixture {
        fn write(&self, name: &str, content: &[u8]) {
            std::fs::write(self.dir.path().join(name), content).unwrap();
        }

        fn read(&self, name: &str) -> Vec<u8> {
            std::fs::read(self.dir.path().join(name)).unwrap()
        }

        fn fd(&self) -> BorrowedFd<'_> {
            self.ref_file.as_fd()
        }
    }

    #[test]
    fn inject_appends_when_absent() {
        let fx = fixture();
        fx.write("login.conf", b"# defaults\n");
        inject(fx.fd(), "login.conf", b"ZZZ").unwrap();
        assert_eq!(fx.read("login.conf"), b"# defaults\nZZZ");
    }

    #[test]
    fn inject_is_idempotent() {
        let fx = fixture();
        fx.write("login.conf", b"# defaults\n");
        inject(fx.fd(), "login.conf", b"ZZZ").unwrap();
        let once = fx.read("login.conf");
        inject(fx.fd(), "login.conf", b"ZZZ").unwrap();
        assert_eq!(fx.read("login.conf"), once);
    }

    #[test]
    fn inject_skips_empty_files() {
        let fx = fixture();
        fx.write("empty", b"");
        inject(fx.fd(), "empty", b"ZZZ").unwrap();
        assert_eq!(fx.read("empty"), b"");
    }

    #[test]
    fn inject_skips_when_substring_present() {
        let fx = fixture();
        fx.write("f", b"aaZZZbb");
        inject(fx.fd(), "f", b"ZZZ").unwrap();
        assert_eq!(fx.read("f"), b"aaZZZbb");
    }

    #[test]
    fn inject_then_uninject_restores_original() {
        let fx = fixture();
        fx.write("f", b"original content\n");
        inject(fx.fd(), "f", b"injected\n").unwrap();
        assert_eq!(fx.read("f"), b"original content\ninjected\n");
        uninject(fx.fd(), "f", b"injected\n").unwrap();
        assert_eq!(fx.read("f"), b"original content\n");
    }

    #[test]
    fn uninject_removes_interior_occurrence() {
        let fx = fixture();
        fx.write("f", b"headINJECTtail");
        uninject(fx.fd(), "f", b"INJECT").unwrap();
        assert_eq!(fx.read("f"), b"headtail");
    }

    #[test]
    fn uninject_without_occurrence_is_a_no_op() {
        let fx = fixture();
        fx.write("f", b"untouched");
        uninject(fx.fd(), "f", b"missing").unwrap();
        assert_eq!(fx.read("f"), b"untouched");
    }

    #[test]
    fn uninject_removes_only_first_occurrence() {
        let fx = fixture();
        fx.write("f", b"xABCyABCz");
        uninject(fx.fd(), "f", b"ABC").unwrap();
        assert_eq!(fx.read("f"), b"xyABCz");
    }

    #[test]
    fn search_handles_nul_bytes_and_chunk_boundaries() {
        let fx = fixture();
        let mut content = vec![b'a'; 8000];
        content.extend_from_slice(b"ne\0edle");
        content.extend(vec![b'b'; 100]);
        fx.write("big", &content);
        let file = std::fs::File::open(fx.dir.path().join("big")).unwrap();
        assert_eq!(find_in_file(&file, b"ne\0edle").unwrap(), Some(8000));
        let file = std::fs::File::open(fx.dir.path().join("big")).unwrap();
        assert_eq!(find_in_file(&file, b"absent").unwrap(), None);
    }

    #[test]
    fn no_temp_file_remains_after_success() {
        let fx = fixture();
        fx.write("f", b"content\n");
        inject(fx.fd(), "f", b"more\n").unwrap();
        assert!(!fx.dir.path().join("f-bedrock-backup").exists());
    }
}
