//! Filesystem helpers: tar.gz packing with excludes, extraction, copies and sizes.
//!
//! Everything that walks a tree runs on the blocking pool.

use std::{
    fs::{self, File},
    io::{self, BufReader, BufWriter, Write as _},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context as _;
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use walkdir::WalkDir;

use crate::runner::{CommandRunner, CommandSpec};

const OPENSSL_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Exclude patterns relative to the archived root. `./cache`, `cache` and `log/app*` are all
/// accepted; a trailing `*` matches any suffix.
#[derive(Clone, Debug, Default)]
pub struct Excludes(Vec<String>);

impl Excludes {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            patterns
                .into_iter()
                .map(|p| normalize(p.as_ref()))
                .filter(|p| !p.is_empty())
                .collect(),
        )
    }

    pub fn push(&mut self, pattern: &str) {
        let p = normalize(pattern);
        if !p.is_empty() {
            self.0.push(p);
        }
    }

    pub fn matches(&self, rel: &str) -> bool {
        let rel = normalize(rel);
        self.0.iter().any(|pat| match pat.strip_suffix('*') {
            Some(prefix) => rel.starts_with(prefix),
            None => rel == *pat || rel.starts_with(&format!("{pat}/")),
        })
    }
}

fn normalize(p: &str) -> String {
    p.trim()
        .trim_start_matches("./")
        .trim_start_matches('/')
        .trim_end_matches('/')
        .to_string()
}

/// Packs the contents of `src` (not the directory itself) into a gzip tarball at `dest`.
pub async fn tar_gz_dir(src: &Path, dest: &Path, excludes: Excludes) -> anyhow::Result<()> {
    let src = src.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || tar_gz_dir_blocking(&src, &dest, &excludes)).await?
}

fn tar_gz_dir_blocking(src: &Path, dest: &Path, excludes: &Excludes) -> anyhow::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create dir {}", parent.display()))?;
    }
    let file = File::create(dest).with_context(|| format!("create {}", dest.display()))?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let mut walker = WalkDir::new(src).min_depth(1).sort_by_file_name().into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry.with_context(|| format!("walk {}", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .with_context(|| format!("strip prefix {}", src.display()))?;
        let rel_str = rel.to_string_lossy();
        if excludes.matches(&rel_str) || entry.path() == dest {
            if entry.file_type().is_dir() {
                walker.skip_current_dir();
            }
            continue;
        }
        if entry.file_type().is_dir() {
            builder.append_dir(rel, entry.path())?;
        } else {
            builder
                .append_path_with_name(entry.path(), rel)
                .with_context(|| format!("append {}", entry.path().display()))?;
        }
    }

    let encoder = builder.into_inner()?;
    encoder.finish()?.flush()?;
    Ok(())
}

pub async fn extract_tar_gz(archive: &Path, dest: &Path) -> anyhow::Result<()> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        fs::create_dir_all(&dest).with_context(|| format!("create dir {}", dest.display()))?;
        let file = File::open(&archive).with_context(|| format!("open {}", archive.display()))?;
        let mut tar = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
        tar.set_preserve_permissions(true);
        tar.unpack(&dest)
            .with_context(|| format!("extract {}", archive.display()))?;
        Ok(())
    })
    .await?
}

pub async fn gzip_file(src: &Path, dest: &Path) -> anyhow::Result<()> {
    let src = src.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let mut input = BufReader::new(File::open(&src)?);
        let out = File::create(&dest).with_context(|| format!("create {}", dest.display()))?;
        let mut encoder = GzEncoder::new(BufWriter::new(out), Compression::default());
        io::copy(&mut input, &mut encoder)?;
        encoder.finish()?.flush()?;
        Ok(())
    })
    .await?
}

/// Encrypts `path` in place with `openssl enc -aes-256-cbc`.
pub async fn encrypt_file(
    runner: &dyn CommandRunner,
    path: &Path,
    secret: &str,
) -> anyhow::Result<()> {
    openssl_in_place(runner, path, &["enc", "-aes-256-cbc", "-salt"], secret).await
}

pub async fn decrypt_file(
    runner: &dyn CommandRunner,
    path: &Path,
    secret: &str,
) -> anyhow::Result<()> {
    openssl_in_place(runner, path, &["enc", "-d", "-aes-256-cbc"], secret).await
}

async fn openssl_in_place(
    runner: &dyn CommandRunner,
    path: &Path,
    args: &[&str],
    secret: &str,
) -> anyhow::Result<()> {
    let tmp = path.with_extension("enc.tmp");
    let mut spec = CommandSpec::new("openssl", args.iter().copied());
    spec.args.extend([
        "-k".to_string(),
        secret.to_string(),
        "-in".to_string(),
        path.to_string_lossy().to_string(),
        "-out".to_string(),
        tmp.to_string_lossy().to_string(),
    ]);
    let out = runner.run(spec, OPENSSL_TIMEOUT).await?;
    if !out.success() {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(anyhow::anyhow!(
            "openssl failed: {}",
            mask_secret(&out.combined(), secret)
        ));
    }
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

pub fn mask_secret(text: &str, secret: &str) -> String {
    if secret.is_empty() {
        text.to_string()
    } else {
        text.replace(secret, "******")
    }
}

pub async fn dir_size(path: &Path) -> u64 {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || dir_size_blocking(&path))
        .await
        .unwrap_or(0)
}

pub fn dir_size_blocking(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Recursive copy. With `overwrite == false` existing destination files are kept (`cp -rn`).
pub async fn copy_dir(src: &Path, dst: &Path, overwrite: bool) -> anyhow::Result<()> {
    let src = src.to_path_buf();
    let dst = dst.to_path_buf();
    tokio::task::spawn_blocking(move || copy_dir_blocking(&src, &dst, overwrite)).await?
}

fn copy_dir_blocking(src: &Path, dst: &Path, overwrite: bool) -> anyhow::Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("create dir {}", dst.display()))?;
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.with_context(|| format!("walk {}", src.display()))?;
        let rel = entry.path().strip_prefix(src)?;
        let target: PathBuf = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if target.exists() && !overwrite {
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(entry.path(), &target)
            .with_context(|| format!("copy {} -> {}", entry.path().display(), target.display()))?;
    }
    Ok(())
}

pub async fn copy_file(src: &Path, dst: &Path) -> anyhow::Result<()> {
    if let Some(parent) = dst.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(src, dst)
        .await
        .with_context(|| format!("copy {} -> {}", src.display(), dst.display()))?;
    Ok(())
}

pub async fn remove_dir_if_exists(path: &Path) -> anyhow::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
    }
}

pub async fn is_empty_dir(path: &Path) -> bool {
    match tokio::fs::read_dir(path).await {
        Ok(mut rd) => matches!(rd.next_entry().await, Ok(None)),
        Err(_) => false,
    }
}
