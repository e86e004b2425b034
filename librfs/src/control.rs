//! Control directory (`/:c`, `/:config`) and its command files.

use async_trait::async_trait;
use std::sync::Arc;

use crate::resolver::Resolver;

/// Names under which the control directory is reachable from the root.
pub const CONTROL_DIR_NAMES: [&str; 2] = [":c", ":config"];

pub const FLUSH_FILE_NAME: &str = "flush";

pub const FLUSH_USAGE: &str =
    "write ':all' (or ':a') to flush the whole cache, or a path to flush that resource\n";

/// What a cache invalidation covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    All,
    Path(String),
}

impl Invalidation {
    /// Decodes text written to the flush file. Only the line terminator is
    /// stripped; blank input is no command.
    pub fn parse_command(data: &[u8]) -> Option<Self> {
        let text = String::from_utf8_lossy(data);
        let command = text.trim_end_matches(['\n', '\r']);
        match command {
            blank if blank.trim().is_empty() => None,
            ":all" | ":a" => Some(Invalidation::All),
            path => Some(Invalidation::Path(path.to_string())),
        }
    }
}

/// A pseudo-file inside the control directory.
///
/// Front-ends add their own (protocol settings, credentials, ...) next to
/// the built-in flush file.
#[async_trait]
pub trait ControlFile: Send + Sync {
    fn name(&self) -> &str;

    async fn read(&self) -> anyhow::Result<Vec<u8>>;

    /// Called with the whole buffer when a writer flushes its handle.
    async fn write(&self, data: &[u8]) -> anyhow::Result<()>;
}

pub struct FlushFile {
    resolver: Arc<Resolver>,
}

impl FlushFile {
    pub fn new(resolver: Arc<Resolver>) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl ControlFile for FlushFile {
    fn name(&self) -> &str {
        FLUSH_FILE_NAME
    }

    async fn read(&self) -> anyhow::Result<Vec<u8>> {
        Ok(FLUSH_USAGE.as_bytes().to_vec())
    }

    async fn write(&self, data: &[u8]) -> anyhow::Result<()> {
        let Some(command) = Invalidation::parse_command(data) else {
            return Ok(());
        };
        self.resolver.invalidate(command).await?;
        Ok(())
    }
}

/// The control directory: the flush file plus whatever the front-end adds.
pub struct ControlDir {
    files: Vec<Arc<dyn ControlFile>>,
}

impl ControlDir {
    pub fn new(resolver: Arc<Resolver>, extra: Vec<Arc<dyn ControlFile>>) -> Self {
        let mut files: Vec<Arc<dyn ControlFile>> = vec![Arc::new(FlushFile::new(resolver))];
        files.extend(extra);
        Self { files }
    }

    pub fn files(&self) -> &[Arc<dyn ControlFile>] {
        &self.files
    }

    pub fn find(&self, name: &str) -> Option<(usize, &Arc<dyn ControlFile>)> {
        self.files
            .iter()
            .enumerate()
            .find(|(_, file)| file.name() == name)
    }
}
