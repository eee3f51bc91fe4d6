// Notebook Relay - SSH Configuration Reconciler
// Keeps exactly one managed Host block per alias in the user's ssh_config

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::SshHostBlock;
use crate::error::{Error, Result};
use crate::fsutil::write_atomic;

/// What `upsert` did to the file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// A `Host`/`Match` stanza with the comments directly above it
#[derive(Debug, Clone)]
struct Block {
    lines: Vec<String>,
    /// Index of the `Host`/`Match` line within `lines`
    header: usize,
}

impl Block {
    fn is_managed(&self, alias: &str) -> bool {
        match parse_header(&self.lines[self.header]) {
            Some((keyword, patterns)) => {
                keyword.eq_ignore_ascii_case("host") && patterns == [alias]
            }
            None => false,
        }
    }

    /// End of the directives; trailing comments are kept on replace
    fn body_end(&self) -> usize {
        self.lines
            .iter()
            .rposition(|l| !is_comment_or_blank(l))
            .map_or(self.lines.len(), |i| i + 1)
    }

    fn body(&self) -> &[String] {
        &self.lines[self.header..self.body_end()]
    }

    fn replace_body(&mut self, rendered: Vec<String>) {
        let end = self.body_end();
        self.lines.splice(self.header..end, rendered);
    }
}

/// ssh_config split into the lines before the first block and the blocks
#[derive(Debug, Clone, Default)]
struct SshConfigFile {
    preamble: Vec<String>,
    blocks: Vec<Block>,
}

impl SshConfigFile {
    fn parse(text: &str) -> Self {
        let mut file = SshConfigFile::default();
        let mut pending: Vec<String> = Vec::new();

        for line in text.lines() {
            if is_comment_or_blank(line) {
                pending.push(line.to_string());
                continue;
            }

            if parse_header(line).is_some() {
                let mut lines = std::mem::take(&mut pending);
                let header = lines.len();
                lines.push(line.to_string());
                file.blocks.push(Block { lines, header });
                continue;
            }

            let current = match file.blocks.last_mut() {
                Some(block) => &mut block.lines,
                None => &mut file.preamble,
            };
            current.append(&mut pending);
            current.push(line.to_string());
        }

        match file.blocks.last_mut() {
            Some(block) => block.lines.append(&mut pending),
            None => file.preamble.append(&mut pending),
        }
        file
    }

    fn render(&self) -> String {
        let mut out = String::new();
        let lines = self
            .preamble
            .iter()
            .chain(self.blocks.iter().flat_map(|b| b.lines.iter()));
        for line in lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    fn last_line_is_blank(&self) -> bool {
        let last = self
            .blocks
            .last()
            .and_then(|b| b.lines.last())
            .or_else(|| self.preamble.last());
        last.map_or(true, |l| l.trim().is_empty())
    }

    fn upsert(&mut self, block: &SshHostBlock) -> UpsertOutcome {
        let rendered = block.render();
        let managed: Vec<usize> = self
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.is_managed(&block.alias))
            .map(|(i, _)| i)
            .collect();

        let Some((&first, duplicates)) = managed.split_first() else {
            let mut lines = Vec::new();
            if !self.last_line_is_blank() {
                lines.push(String::new());
            }
            let header = lines.len();
            lines.extend(rendered);
            self.blocks.push(Block { lines, header });
            return UpsertOutcome::Inserted;
        };

        let unchanged = duplicates.is_empty() && self.blocks[first].body() == rendered.as_slice();
        if unchanged {
            return UpsertOutcome::Unchanged;
        }

        for &index in duplicates.iter().rev() {
            debug!("Removing duplicate Host block for '{}'", block.alias);
            self.blocks.remove(index);
        }
        self.blocks[first].replace_body(rendered);
        UpsertOutcome::Updated
    }

    fn remove(&mut self, alias: &str) -> bool {
        let before = self.blocks.len();
        self.blocks.retain(|b| !b.is_managed(alias));
        self.blocks.len() != before
    }
}

fn is_comment_or_blank(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || trimmed.starts_with('#')
}

/// Split a `Host`/`Match` line into keyword and patterns
///
/// Accepts `Host a b`, `host=a` and quoted patterns.
fn parse_header(line: &str) -> Option<(&str, Vec<&str>)> {
    let trimmed = line.trim();
    let end = trimmed
        .find(|c: char| c.is_whitespace() || c == '=')
        .unwrap_or(trimmed.len());
    let (keyword, rest) = trimmed.split_at(end);

    if !keyword.eq_ignore_ascii_case("host") && !keyword.eq_ignore_ascii_case("match") {
        return None;
    }

    let rest = rest.trim_start();
    let rest = rest.strip_prefix('=').unwrap_or(rest);
    let patterns = rest
        .split_whitespace()
        .map(|p| p.trim_matches('"'))
        .filter(|p| !p.is_empty())
        .collect();
    Some((keyword, patterns))
}

/// Reconciles host blocks in one ssh_config file
#[derive(Debug, Clone)]
pub struct SshConfigReconciler {
    path: PathBuf,
}

impl SshConfigReconciler {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Reconciler for `~/.ssh/config`
    pub fn default_location() -> Result<Self> {
        Ok(Self::new(default_ssh_config_path()?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert or replace the block for `block.alias`
    ///
    /// An existing block keeps its position in the file; duplicates left by
    /// hand edits are removed. The file is only rewritten when it changes.
    pub fn upsert(&self, block: &SshHostBlock) -> Result<UpsertOutcome> {
        let target = self.write_target();
        let mut file = SshConfigFile::parse(&self.read(&target)?);

        let outcome = file.upsert(block);
        if outcome != UpsertOutcome::Unchanged {
            self.write(&target, &file)?;
        }

        match outcome {
            UpsertOutcome::Inserted => {
                info!("Added Host {} to {}", block.alias, target.display())
            }
            UpsertOutcome::Updated => {
                info!("Updated Host {} in {}", block.alias, target.display())
            }
            UpsertOutcome::Unchanged => debug!("Host {} already up to date", block.alias),
        }
        Ok(outcome)
    }

    /// Remove the managed block for `alias`; false if there was none
    pub fn remove(&self, alias: &str) -> Result<bool> {
        let target = self.write_target();
        if !target.exists() {
            return Ok(false);
        }

        let mut file = SshConfigFile::parse(&self.read(&target)?);
        if !file.remove(alias) {
            return Ok(false);
        }

        self.write(&target, &file)?;
        info!("Removed Host {} from {}", alias, target.display());
        Ok(true)
    }

    /// The file to rewrite: the link target when the config is a symlink
    fn write_target(&self) -> PathBuf {
        let is_link = fs::symlink_metadata(&self.path)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);

        if is_link {
            if let Ok(resolved) = fs::canonicalize(&self.path) {
                debug!(
                    "{} is a symlink to {}",
                    self.path.display(),
                    resolved.display()
                );
                return resolved;
            }
        }
        self.path.clone()
    }

    fn read(&self, target: &Path) -> Result<String> {
        match fs::read_to_string(target) {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(source) => Err(Error::ConfigWriteFailed {
                path: target.to_path_buf(),
                source,
            }),
        }
    }

    fn write(&self, target: &Path, file: &SshConfigFile) -> Result<()> {
        write_atomic(target, file.render().as_bytes()).map_err(|source| Error::ConfigWriteFailed {
            path: target.to_path_buf(),
            source,
        })
    }
}

/// Get the default ssh_config path
pub fn default_ssh_config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| {
        Error::Io(std::io::Error::new(
            ErrorKind::NotFound,
            "could not determine home directory",
        ))
    })?;
    Ok(home.join(".ssh").join("config"))
}
