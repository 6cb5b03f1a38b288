//! The script host: a root context plus local-file and upload support.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use capsule_common::{RuntimeConfig, RuntimeError};
use capsule_core::ScriptCache;
use capsule_host::{HttpMethod, HttpRequest, validate};

use crate::RuntimeContext;
use crate::program;

/// Extension of local script files.
pub const SCRIPT_EXTENSION: &str = "rhai";

/// Owns the root [`RuntimeContext`] that per-invocation copies derive from.
pub struct ScriptHost {
    root: RuntimeContext,
    tokens_file: PathBuf,
}

impl ScriptHost {
    /// Create a host from configuration.
    pub fn new(config: &RuntimeConfig) -> Result<Self, RuntimeError> {
        let cache = Arc::new(ScriptCache::new(config.cache_dir()?));
        Self::with_cache(config, cache)
    }

    /// Create a host around an existing cache.
    pub fn with_cache(config: &RuntimeConfig, cache: Arc<ScriptCache>) -> Result<Self, RuntimeError> {
        let root = RuntimeContext::with_cache(config, cache)?;
        let mut host = Self {
            root,
            tokens_file: config.tokens_file()?,
        };
        host.set_token(config.registry.access_token.clone());
        Ok(host)
    }

    /// Load a program into the root context.
    ///
    /// An existing file is run directly; a directory has every `*.rhai`
    /// file beneath it run in path order; anything else goes through the
    /// registry/URL load pipeline.
    pub fn load(&mut self, program: &str) -> Result<(), RuntimeError> {
        let path = Path::new(program);

        if path.is_file() {
            self.root.run_file(path)?;
            return Ok(());
        }

        if path.is_dir() {
            for file in script_files(path)? {
                self.root.run_file(&file)?;
            }
            return Ok(());
        }

        self.root.load(program)
    }

    /// A fresh copy of the root context for one invocation.
    pub fn context(&self) -> RuntimeContext {
        self.root.copy()
    }

    /// The root context.
    pub fn root(&self) -> &RuntimeContext {
        &self.root
    }

    /// Set the access token, expanding aliases from the tokens file.
    pub fn set_token(&mut self, token: Option<String>) {
        let token = token.map(|t| program::expand_token(&self.tokens_file, &t));
        self.root.set_token(token);
    }

    /// Toggle verbose output for the root and future copies.
    pub fn set_verbose(&self, verbose: bool) {
        self.root.set_verbose(verbose);
    }

    /// Upload a program archive to the registry under `name`.
    pub fn upload(&self, name: &str, archive: &[u8]) -> Result<(), RuntimeError> {
        if !program::is_valid_name(name) {
            return Err(RuntimeError::invalid_program(
                name,
                "must be letters, digits, and dashes, starting with a letter or digit",
            ));
        }
        let token = self.root.token().ok_or_else(|| RuntimeError::Unauthorized {
            operation: "upload".to_string(),
        })?;

        let url = program::upload_url(self.root.registry_url(), name, token)?;
        let request = HttpRequest {
            method: HttpMethod::Post,
            uri: url,
            headers: vec![("Content-Type".to_string(), "application/zip".to_string())],
            body: Some(archive.to_vec()),
            cache: false,
        };

        info!(name = %name, size = archive.len(), "Uploading program");
        let response = self.root.fetch().fetch(&request)?;
        validate(&response).map_err(|source| RuntimeError::Registry {
            program: name.to_string(),
            source,
        })?;

        Ok(())
    }
}

impl std::fmt::Debug for ScriptHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptHost")
            .field("root", &self.root)
            .field("tokens_file", &self.tokens_file)
            .finish()
    }
}

/// Script files under `dir`, subdirectories included, sorted by path.
///
/// Finding none is an error.
fn script_files(dir: &Path) -> Result<Vec<PathBuf>, RuntimeError> {
    let mut files = Vec::new();
    collect_scripts(dir, &mut files)?;
    if files.is_empty() {
        return Err(RuntimeError::NoScripts {
            path: dir.display().to_string(),
        });
    }
    files.sort();
    debug!(dir = %dir.display(), count = files.len(), "Found script files");
    Ok(files)
}

fn collect_scripts(dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), RuntimeError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_scripts(&path, files)?;
        } else if path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(SCRIPT_EXTENSION))
        {
            files.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use capsule_core::Sink;

    fn host(dir: &Path, token: Option<&str>) -> ScriptHost {
        let config = RuntimeConfig {
            home: Some(dir.to_path_buf()),
            registry: capsule_common::RegistryConfig {
                base_url: "http://127.0.0.1:1/api/v1".into(),
                access_token: token.map(str::to_string),
            },
            ..Default::default()
        };
        let host = ScriptHost::new(&config).unwrap();
        host.root().set_stdout(Sink::null());
        host.root().set_stderr(Sink::null());
        host
    }

    #[test]
    fn test_load_local_file_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        let scripts = dir.path().join("prog");
        std::fs::create_dir(&scripts).unwrap();
        std::fs::write(scripts.join("b.rhai"), "let total = base + 1;").unwrap();
        std::fs::write(scripts.join("a.rhai"), "let base = 41;").unwrap();
        std::fs::write(scripts.join("notes.txt"), "not a script").unwrap();

        let mut host = host(dir.path(), None);
        host.load(scripts.to_str().unwrap()).unwrap();
        assert_eq!(host.root().get("total").unwrap().as_int().unwrap(), 42);

        let single = dir.path().join("single.rhai");
        std::fs::write(&single, "fn double(x) { x * 2 }").unwrap();
        host.load(single.to_str().unwrap()).unwrap();

        let mut ctx = host.context();
        let doubled = ctx.call("double", vec![rhai::Dynamic::from(21_i64)]).unwrap();
        assert_eq!(doubled.as_int().unwrap(), 42);
    }

    #[test]
    fn test_load_directory_walks_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        let scripts = dir.path().join("prog");
        std::fs::create_dir_all(scripts.join("lib")).unwrap();
        std::fs::write(scripts.join("lib").join("math.rhai"), "fn triple(x) { x * 3 }").unwrap();
        std::fs::write(scripts.join("main.rhai"), "let answer = 14;").unwrap();

        let mut host = host(dir.path(), None);
        host.load(scripts.to_str().unwrap()).unwrap();

        let mut ctx = host.context();
        assert_eq!(ctx.run("triple(answer)").unwrap().as_int().unwrap(), 42);
    }

    #[test]
    fn test_load_directory_without_scripts() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty");
        std::fs::create_dir_all(empty.join("nested")).unwrap();
        std::fs::write(empty.join("README.txt"), "no scripts here").unwrap();

        let mut host = host(dir.path(), None);
        let err = host.load(empty.to_str().unwrap()).unwrap_err();

        assert!(matches!(err, RuntimeError::NoScripts { .. }));
        assert_eq!(
            err.to_string(),
            format!("No valid files found at {}", empty.display())
        );
    }

    #[test]
    fn test_token_alias_expanded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tokens"), "ci = real-token\n").unwrap();

        let mut host = host(dir.path(), Some("ci"));
        assert_eq!(host.root().token(), Some("real-token"));
        assert_eq!(host.context().token(), Some("real-token"));

        host.set_token(None);
        assert_eq!(host.root().token(), None);
    }

    #[test]
    fn test_upload_requires_token_and_valid_name() {
        let dir = tempfile::tempdir().unwrap();
        let host = host(dir.path(), None);

        assert!(matches!(
            host.upload("weather", b"PK"),
            Err(RuntimeError::Unauthorized { .. })
        ));
        assert!(matches!(
            host.upload("bad name", b"PK"),
            Err(RuntimeError::InvalidProgram { .. })
        ));
        assert_eq!(host.root().fetch().request_count(), 0);
    }

    #[test]
    fn test_upload_transport_failure() {
        let dir = tempfile::tempdir().unwrap();
        let host = host(dir.path(), Some("tok"));

        assert!(matches!(
            host.upload("weather", b"PK"),
            Err(RuntimeError::Transport { .. })
        ));
    }
}
