use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use taskd_protocol::new_task_id;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::TaskError;

/// Name of the archive produced in a finished task's output directory.
pub const RESULT_ARCHIVE: &str = "result.zip";

/// Directory under the tasks root where uploads are written while they stream in.
pub const SPOOL_DIR: &str = ".uploads";

pub const AUDIO_EXTENSIONS: &[&str] = &[".wav"];
pub const MODEL_EXTENSIONS: &[&str] = &[".pth", ".index"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactCategory {
    Input,
    Output,
    Model,
}

impl ArtifactCategory {
    pub const ALL: [ArtifactCategory; 3] = [
        ArtifactCategory::Input,
        ArtifactCategory::Output,
        ArtifactCategory::Model,
    ];

    pub fn dir_name(&self) -> &'static str {
        match self {
            ArtifactCategory::Input => "input",
            ArtifactCategory::Output => "output",
            ArtifactCategory::Model => "model",
        }
    }
}

/// Spooled file, removed on drop unless it was moved into a task directory.
#[derive(Debug)]
struct SpoolFile {
    path: PathBuf,
    kept: bool,
}

impl SpoolFile {
    async fn persist(mut self, dest: &Path) -> io::Result<()> {
        tokio::fs::rename(&self.path, dest).await?;
        self.kept = true;
        Ok(())
    }
}

impl Drop for SpoolFile {
    fn drop(&mut self) {
        if !self.kept {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// One uploaded file, spooled to disk and waiting for [`TaskFiles::store`].
#[derive(Debug)]
pub struct Upload {
    file_name: String,
    len: u64,
    spool: SpoolFile,
}

impl Upload {
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Lowercased extension with its leading dot, if any.
    fn extension(&self) -> Option<String> {
        Path::new(&self.file_name)
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy().to_ascii_lowercase()))
    }
}

/// Receives an upload chunk by chunk. Fails as soon as the byte count passes
/// the upload limit; dropping the writer removes what was spooled.
#[derive(Debug)]
pub struct UploadWriter {
    file: tokio::fs::File,
    spool: SpoolFile,
    file_name: String,
    len: u64,
    limit: u64,
}

impl UploadWriter {
    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), TaskError> {
        self.len += chunk.len() as u64;
        if self.len > self.limit {
            return Err(size_exceeded(&self.file_name, self.limit));
        }
        self.file.write_all(chunk).await?;
        Ok(())
    }

    pub async fn finish(self) -> Result<Upload, TaskError> {
        let UploadWriter {
            mut file,
            spool,
            file_name,
            len,
            ..
        } = self;
        file.flush().await?;
        drop(file);
        Ok(Upload {
            file_name,
            len,
            spool,
        })
    }
}

fn size_exceeded(file_name: &str, limit: u64) -> TaskError {
    TaskError::ResourceExhausted(format!(
        "SizeExceeded: {file_name} is larger than {limit} bytes"
    ))
}

/// Filesystem collaborator for task artifacts.
#[derive(Debug, Clone)]
pub struct TaskFiles {
    root: PathBuf,
    max_upload_size: u64,
}

impl TaskFiles {
    pub fn new(root: impl Into<PathBuf>, max_upload_size: u64) -> Self {
        let root = root.into();
        let root = std::path::absolute(&root).unwrap_or(root);
        Self {
            root,
            max_upload_size,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_upload_size(&self) -> u64 {
        self.max_upload_size
    }

    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.root.join(task_id)
    }

    pub fn dir(&self, task_id: &str, category: ArtifactCategory) -> PathBuf {
        self.task_dir(task_id).join(category.dir_name())
    }

    pub fn result_path(&self, task_id: &str) -> PathBuf {
        self.dir(task_id, ArtifactCategory::Output).join(RESULT_ARCHIVE)
    }

    pub fn spool_dir(&self) -> PathBuf {
        self.root.join(SPOOL_DIR)
    }

    /// Create the task directory and its three category directories. The task
    /// directory must not exist yet: an existing one is `AlreadyExists` and is
    /// left untouched.
    pub async fn prepare(&self, task_id: &str) -> Result<(), TaskError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let task_dir = self.task_dir(task_id);
        match tokio::fs::create_dir(&task_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(TaskError::AlreadyExists(task_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        }
        for category in ArtifactCategory::ALL {
            if let Err(e) = tokio::fs::create_dir(self.dir(task_id, category)).await {
                self.purge(task_id).await;
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Start spooling an upload named `file_name`.
    pub async fn begin_upload(
        &self,
        file_name: impl Into<String>,
    ) -> Result<UploadWriter, TaskError> {
        let dir = self.spool_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}.part", new_task_id()));
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        Ok(UploadWriter {
            file,
            spool: SpoolFile { path, kept: false },
            file_name: file_name.into(),
            len: 0,
            limit: self.max_upload_size,
        })
    }

    /// Spool an upload that is already in memory.
    pub async fn upload(
        &self,
        file_name: impl Into<String>,
        data: &[u8],
    ) -> Result<Upload, TaskError> {
        let mut writer = self.begin_upload(file_name).await?;
        for chunk in data.chunks(64 * 1024) {
            writer.write(chunk).await?;
        }
        writer.finish().await
    }

    /// Move `uploads` to `<index><ext>` under the category directory.
    ///
    /// Every upload is checked before anything is written: an extension outside
    /// `allowed` is `InvalidRequest`, a file over the size limit is
    /// `ResourceExhausted`.
    pub async fn store(
        &self,
        task_id: &str,
        category: ArtifactCategory,
        uploads: Vec<Upload>,
        allowed: &[&str],
    ) -> Result<Vec<PathBuf>, TaskError> {
        let mut named = Vec::with_capacity(uploads.len());
        for (index, upload) in uploads.into_iter().enumerate() {
            let ext = upload
                .extension()
                .filter(|ext| allowed.contains(&ext.as_str()))
                .ok_or_else(|| {
                    TaskError::InvalidRequest(format!(
                        "InvalidType: {} must be one of {allowed:?}",
                        upload.file_name
                    ))
                })?;
            if upload.len > self.max_upload_size {
                return Err(size_exceeded(&upload.file_name, self.max_upload_size));
            }
            named.push((format!("{index}{ext}"), upload));
        }

        let dir = self.dir(task_id, category);
        tokio::fs::create_dir_all(&dir).await?;
        let mut paths = Vec::with_capacity(named.len());
        for (file_name, upload) in named {
            let path = dir.join(file_name);
            upload.spool.persist(&path).await?;
            paths.push(path);
        }
        debug!(task_id, category = category.dir_name(), files = paths.len(), "stored uploads");
        Ok(paths)
    }

    /// Pack every file below `dir` into `dir/result.zip` and remove the packed
    /// originals.
    pub async fn archive(&self, dir: &Path) -> Result<PathBuf, TaskError> {
        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking(move || archive_dir(&dir))
            .await
            .map_err(|e| TaskError::Archive(e.to_string()))?
    }

    /// Recursive removal. A missing directory counts as removed.
    pub async fn remove_dir(&self, path: &Path) -> Result<(), TaskError> {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Best-effort removal of the whole task directory.
    pub async fn purge(&self, task_id: &str) {
        if let Err(e) = self.remove_dir(&self.task_dir(task_id)).await {
            warn!(task_id, error = %e, "failed to remove task directory");
        }
    }
}

fn archive_dir(dir: &Path) -> Result<PathBuf, TaskError> {
    let target = dir.join(RESULT_ARCHIVE);
    let partial = dir.join(format!("{RESULT_ARCHIVE}.partial"));

    let mut files = Vec::new();
    collect_files(dir, Path::new(""), &mut files)?;
    files.retain(|rel| dir.join(rel) != target && dir.join(rel) != partial);
    files.sort();

    let mut zip = ZipWriter::new(File::create(&partial)?);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for rel in &files {
        let name = rel.to_string_lossy().replace('\\', "/");
        zip.start_file(name, options)
            .map_err(|e| TaskError::Archive(e.to_string()))?;
        let mut src = File::open(dir.join(rel))?;
        io::copy(&mut src, &mut zip)?;
    }
    zip.finish().map_err(|e| TaskError::Archive(e.to_string()))?;
    std::fs::rename(&partial, &target)?;

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path == target {
            continue;
        }
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(target)
}

fn collect_files(base: &Path, rel: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in std::fs::read_dir(base.join(rel))? {
        let entry = entry?;
        let child = rel.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            collect_files(base, &child, out)?;
        } else {
            out.push(child);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(root: &Path) -> TaskFiles {
        TaskFiles::new(root, 1024)
    }

    fn list(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn prepare_creates_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let files = files(tmp.path());
        files.prepare("t1").await.unwrap();
        assert_eq!(list(&files.task_dir("t1")), vec!["input", "model", "output"]);
    }

    #[tokio::test]
    async fn prepare_refuses_existing_task_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let files = files(tmp.path());
        files.prepare("t1").await.unwrap();
        std::fs::write(files.dir("t1", ArtifactCategory::Input).join("0.wav"), b"x").unwrap();

        let err = files.prepare("t1").await.unwrap_err();
        assert!(matches!(err, TaskError::AlreadyExists(id) if id == "t1"));
        assert_eq!(list(&files.dir("t1", ArtifactCategory::Input)), vec!["0.wav"]);
    }

    #[tokio::test]
    async fn store_renames_by_index() {
        let tmp = tempfile::tempdir().unwrap();
        let files = files(tmp.path());
        let uploads = vec![
            files.upload("voice.PTH", b"m").await.unwrap(),
            files.upload("voice.index", b"i").await.unwrap(),
        ];
        let paths = files
            .store("t1", ArtifactCategory::Model, uploads, MODEL_EXTENSIONS)
            .await
            .unwrap();

        assert_eq!(paths.len(), 2);
        assert_eq!(list(&files.dir("t1", ArtifactCategory::Model)), vec!["0.pth", "1.index"]);
        assert_eq!(std::fs::read(&paths[0]).unwrap(), b"m");
        assert!(list(&files.spool_dir()).is_empty());
    }

    #[tokio::test]
    async fn store_rejects_wrong_type_before_writing() {
        let tmp = tempfile::tempdir().unwrap();
        let files = files(tmp.path());
        let uploads = vec![
            files.upload("a.wav", b"ok").await.unwrap(),
            files.upload("b.mp3", b"no").await.unwrap(),
        ];
        let err = files
            .store("t1", ArtifactCategory::Input, uploads, AUDIO_EXTENSIONS)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidRequest(msg) if msg.contains("InvalidType")));
        assert!(!files.dir("t1", ArtifactCategory::Input).exists());
        assert!(list(&files.spool_dir()).is_empty());
    }

    #[tokio::test]
    async fn writer_stops_at_the_limit() {
        let tmp = tempfile::tempdir().unwrap();
        let files = files(tmp.path());
        let mut writer = files.begin_upload("big.wav").await.unwrap();
        writer.write(&[0u8; 1000]).await.unwrap();

        let err = writer.write(&[0u8; 100]).await.unwrap_err();
        assert!(matches!(err, TaskError::ResourceExhausted(msg) if msg.contains("SizeExceeded")));
        let spooled = list(&files.spool_dir());
        assert_eq!(spooled.len(), 1);
        let on_disk = std::fs::metadata(files.spool_dir().join(&spooled[0])).unwrap().len();
        assert!(on_disk <= 1024);

        drop(writer);
        assert!(list(&files.spool_dir()).is_empty());
        assert!(files.upload("big.wav", &[0u8; 2048]).await.is_err());
        assert!(list(&files.spool_dir()).is_empty());
    }

    #[tokio::test]
    async fn unstored_upload_is_removed_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let files = files(tmp.path());
        let upload = files.upload("a.wav", b"RIFF").await.unwrap();
        assert_eq!(upload.len(), 4);
        assert_eq!(list(&files.spool_dir()).len(), 1);
        drop(upload);
        assert!(list(&files.spool_dir()).is_empty());
    }

    #[tokio::test]
    async fn archive_leaves_exactly_one_file() {
        let tmp = tempfile::tempdir().unwrap();
        let files = files(tmp.path());
        files.prepare("t1").await.unwrap();
        let out = files.dir("t1", ArtifactCategory::Output);
        std::fs::write(out.join("a.wav"), b"aaaa").unwrap();
        std::fs::create_dir(out.join("logs")).unwrap();
        std::fs::write(out.join("logs").join("train.log"), b"log").unwrap();

        let archive = files.archive(&out).await.unwrap();
        assert_eq!(archive, files.result_path("t1"));
        assert_eq!(list(&out), vec![RESULT_ARCHIVE]);

        let mut zip = zip::ZipArchive::new(File::open(&archive).unwrap()).unwrap();
        assert_eq!(zip.len(), 2);
        let mut entry = zip.by_name("logs/train.log").unwrap();
        let mut body = String::new();
        io::Read::read_to_string(&mut entry, &mut body).unwrap();
        assert_eq!(body, "log");
    }

    #[tokio::test]
    async fn archive_of_empty_dir_is_valid() {
        let tmp = tempfile::tempdir().unwrap();
        let files = files(tmp.path());
        files.prepare("t1").await.unwrap();
        let archive = files
            .archive(&files.dir("t1", ArtifactCategory::Output))
            .await
            .unwrap();
        let zip = zip::ZipArchive::new(File::open(&archive).unwrap()).unwrap();
        assert_eq!(zip.len(), 0);
    }

    #[tokio::test]
    async fn remove_dir_tolerates_missing_path() {
        let tmp = tempfile::tempdir().unwrap();
        let files = files(tmp.path());
        files.prepare("t1").await.unwrap();
        files.remove_dir(&files.task_dir("t1")).await.unwrap();
        assert!(!files.task_dir("t1").exists());
        files.remove_dir(&files.task_dir("t1")).await.unwrap();
        files.purge("t1").await;
    }
}
