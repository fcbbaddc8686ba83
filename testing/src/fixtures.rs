use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const DEFAULT_YAML: &str = r#"system:
  name: strata
  version: 1.0.0
  environment: development
  debug: false
database:
  host: localhost
  port: 5432
  pool_size: 10
api:
  host: 0.0.0.0
  port: 8000
  workers: 4
  cors_origins:
    - http://localhost:3000
document_processor:
  supported_formats: [pdf, docx, txt]
  max_concurrent: 4
logging:
  level: INFO
"#;

pub const DEVELOPMENT_YAML: &str = r#"system:
  debug: true
api:
  workers: 1
  cors_origins:
    - http://localhost:3000
    - http://localhost:5173
logging:
  level: DEBUG
"#;

pub const PRODUCTION_YAML: &str = r#"system:
  environment: production
  debug: false
database:
  pool_size: 50
api:
  workers: 16
  cors_origins:
    - https://app.example.com
logging:
  level: WARNING
"#;

pub const TESTING_YAML: &str = r#"system:
  environment: testing
database:
  url: "${TEST_DATABASE_URL:sqlite:///tmp/strata-test.db}"
logging:
  level: ERROR
"#;

/// A temporary configuration directory. Removed on drop.
pub struct ConfigTree {
    dir: TempDir
}

impl ConfigTree {
    /// An empty directory.
    pub fn empty() -> anyhow::Result<Self> {
        Ok(Self {
            dir: TempDir::new()?
        })
    }

    /// `default`, `development`, `production` and `testing` documents.
    pub fn standard() -> anyhow::Result<Self> {
        let tree = Self::empty()?;
        tree.write("default.yaml", DEFAULT_YAML)?;
        tree.write("development.yaml", DEVELOPMENT_YAML)?;
        tree.write("production.yaml", PRODUCTION_YAML)?;
        tree.write("testing.yaml", TESTING_YAML)?;
        Ok(tree)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn join(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.join("backups")
    }

    /// Writes `relative`, creating parent directories.
    pub fn write(&self, relative: &str, content: &str) -> anyhow::Result<PathBuf> {
        let path = self.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, content)?;
        Ok(path)
    }

    pub fn read(&self, relative: &str) -> anyhow::Result<String> {
        Ok(fs::read_to_string(self.join(relative))?)
    }

    pub fn remove(&self, relative: &str) -> anyhow::Result<()> {
        fs::remove_file(self.join(relative))?;
        Ok(())
    }

    pub fn exists(&self, relative: &str) -> bool {
        self.join(relative).exists()
    }
}
