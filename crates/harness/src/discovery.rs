//! Test discovery by file name convention
//!
//! Files named `ut_<module>[_<descriptor>].<ext>` belong to `<module>`. The
//! descriptors `setup`, `subprocess` and `shutdown` are reserved for the
//! module lifecycle; every other file is an ordinary test.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{HarnessError, HarnessResult};
use crate::pragma::Pragmas;

const PREFIX: &str = "ut_";

/// What a file does within its module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Test,
    Setup,
    Subprocess,
    Shutdown,
}

impl Role {
    fn from_descriptor(descriptor: Option<&str>) -> Self {
        match descriptor {
            Some("setup") => Role::Setup,
            Some("subprocess") => Role::Subprocess,
            Some("shutdown") => Role::Shutdown,
            _ => Role::Test,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Test => write!(f, "test"),
            Role::Setup => write!(f, "setup"),
            Role::Subprocess => write!(f, "subprocess"),
            Role::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Parsed form of a test file name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileName {
    pub module: String,
    pub descriptor: Option<String>,
    pub extension: String,
}

impl FileName {
    /// Parse a bare file name (no directories) against the `ut_` grammar
    pub fn parse(name: &str) -> Result<Self, String> {
        let body = name
            .strip_prefix(PREFIX)
            .ok_or_else(|| format!("missing '{}' prefix", PREFIX))?;

        let (stem, extension) = body
            .rsplit_once('.')
            .ok_or_else(|| "missing extension".to_string())?;
        if extension.is_empty() {
            return Err("empty extension".to_string());
        }

        let (module, descriptor) = match stem.split_once('_') {
            Some((module, descriptor)) => {
                if descriptor.is_empty() {
                    return Err("empty descriptor".to_string());
                }
                (module, Some(descriptor.to_string()))
            }
            None => (stem, None),
        };
        if module.is_empty() {
            return Err("empty module name".to_string());
        }

        Ok(Self {
            module: module.to_string(),
            descriptor,
            extension: extension.to_string(),
        })
    }

    pub fn role(&self) -> Role {
        Role::from_descriptor(self.descriptor.as_deref())
    }
}

/// A discovered file; immutable once discovered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestFile {
    pub path: PathBuf,
    pub module: String,
    pub descriptor: Option<String>,
    pub role: Role,
}

impl TestFile {
    /// Classify a path by its file name
    pub fn from_path(path: &Path) -> HarnessResult<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| HarnessError::Discovery {
                path: path.to_path_buf(),
                reason: "file name is not valid UTF-8".to_string(),
            })?;

        let parsed = FileName::parse(name).map_err(|reason| HarnessError::Discovery {
            path: path.to_path_buf(),
            reason,
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            role: parsed.role(),
            module: parsed.module,
            descriptor: parsed.descriptor,
        })
    }

    /// Bare file name for display
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    /// Read this file's directives
    pub fn pragmas(&self) -> HarnessResult<Pragmas> {
        Pragmas::from_file(&self.path)
    }
}

/// All files of one module
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestModule {
    pub name: String,
    pub setup: Option<TestFile>,
    pub subprocess: Option<TestFile>,
    pub shutdown: Option<TestFile>,

    /// Ordinary tests, ordered by file name
    pub tests: Vec<TestFile>,

    /// Set when the module's lifecycle is ambiguous; the module is not executed
    pub discovery_error: Option<String>,
}

impl TestModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add a file, enforcing at most one file per reserved role
    pub fn add(&mut self, file: TestFile) -> HarnessResult<()> {
        if file.module != self.name {
            return Err(HarnessError::ModuleConfig {
                module: self.name.clone(),
                reason: format!("{} belongs to module '{}'", file.file_name(), file.module),
            });
        }

        let slot = match file.role {
            Role::Test => {
                self.tests.push(file);
                return Ok(());
            }
            Role::Setup => &mut self.setup,
            Role::Subprocess => &mut self.subprocess,
            Role::Shutdown => &mut self.shutdown,
        };

        if let Some(existing) = slot {
            return Err(HarnessError::ModuleConfig {
                module: self.name.clone(),
                reason: format!(
                    "duplicate {} files: {} and {}",
                    file.role,
                    existing.file_name(),
                    file.file_name()
                ),
            });
        }
        *slot = Some(file);
        Ok(())
    }

    pub fn is_runnable(&self) -> bool {
        self.discovery_error.is_none()
    }
}

/// A file skipped during discovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryWarning {
    pub path: PathBuf,
    pub reason: String,
}

/// Result of scanning a directory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Roster {
    pub modules: BTreeMap<String, TestModule>,
    pub warnings: Vec<DiscoveryWarning>,
}

impl Roster {
    /// Group already-classified files into modules
    pub fn from_files(files: impl IntoIterator<Item = TestFile>) -> Self {
        let mut roster = Roster::default();
        for file in files {
            roster.insert(file);
        }
        roster
    }

    fn insert(&mut self, file: TestFile) {
        let module = self
            .modules
            .entry(file.module.clone())
            .or_insert_with(|| TestModule::new(file.module.clone()));

        if let Err(e) = module.add(file) {
            warn!("{}", e);
            if module.discovery_error.is_none() {
                module.discovery_error = Some(e.to_string());
            }
        }
    }

    /// Keep only the named module
    pub fn select_module(mut self, name: &str) -> HarnessResult<Self> {
        let module = self
            .modules
            .remove(name)
            .ok_or_else(|| HarnessError::NotFound(format!("module '{}'", name)))?;
        self.modules = BTreeMap::from([(name.to_string(), module)]);
        Ok(self)
    }

    /// Keep only one test file, together with its module's lifecycle files
    pub fn select_file(mut self, file_name: &str) -> HarnessResult<Self> {
        let wanted = Path::new(file_name)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| file_name.to_string());
        let parsed = FileName::parse(&wanted).map_err(|reason| HarnessError::Discovery {
            path: PathBuf::from(file_name),
            reason,
        })?;
        if parsed.role() != Role::Test {
            return Err(HarnessError::InvalidConfig(format!(
                "{} is a {} file, not a test",
                wanted,
                parsed.role()
            )));
        }

        let mut module = self
            .modules
            .remove(&parsed.module)
            .ok_or_else(|| HarnessError::NotFound(wanted.clone()))?;
        module.tests.retain(|t| t.file_name() == wanted);
        if module.tests.is_empty() {
            return Err(HarnessError::NotFound(wanted));
        }

        self.modules = BTreeMap::from([(parsed.module, module)]);
        Ok(self)
    }

    pub fn test_count(&self) -> usize {
        self.modules.values().map(|m| m.tests.len()).sum()
    }
}

/// Directory scanner
#[derive(Debug, Clone, Default)]
pub struct Discoverer {
    /// Accepted extensions without the dot; empty accepts any
    extensions: Vec<String>,
}

impl Discoverer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_extensions(extensions: Vec<String>) -> Self {
        Self { extensions }
    }

    /// Scan `dir` (non-recursively) and build the module roster
    pub fn scan(&self, dir: &Path) -> HarnessResult<Roster> {
        if !dir.is_dir() {
            return Err(HarnessError::TestDirNotFound(dir.to_path_buf()));
        }

        let mut files = Vec::new();
        let mut warnings = Vec::new();

        for entry in walkdir::WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .follow_links(true)
            .sort_by_file_name()
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| dir.to_path_buf());
                    warn!("Skipping {}: {}", path.display(), e);
                    warnings.push(DiscoveryWarning {
                        path,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();

            match TestFile::from_path(path) {
                Ok(file) => {
                    if self.accepts(path) {
                        files.push(file);
                    } else {
                        debug!("Skipping {} (extension filtered)", path.display());
                    }
                }
                Err(HarnessError::Discovery { path, reason }) => {
                    let looks_like_test = entry.file_name().to_string_lossy().starts_with(PREFIX);
                    if looks_like_test {
                        warn!("Skipping {}: {}", path.display(), reason);
                    } else {
                        debug!("Skipping {}: {}", path.display(), reason);
                    }
                    warnings.push(DiscoveryWarning { path, reason });
                }
                Err(e) => return Err(e),
            }
        }

        let mut roster = Roster::from_files(files);
        roster.warnings = warnings;

        info!(
            "Discovered {} module(s), {} test file(s) in {}",
            roster.modules.len(),
            roster.test_count(),
            dir.display()
        );
        Ok(roster)
    }

    fn accepts(&self, path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        path.extension()
            .map(|ext| self.extensions.iter().any(|e| ext == e.as_str()))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use test_case::test_case;

    #[test_case("ut_math.py", "math", None, Role::Test ; "no descriptor")]
    #[test_case("ut_math_add.py", "math", Some("add"), Role::Test ; "plain descriptor")]
    #[test_case("ut_math_add_big.py", "math", Some("add_big"), Role::Test ; "descriptor with underscore")]
    #[test_case("ut_math_setup.py", "math", Some("setup"), Role::Setup ; "setup")]
    #[test_case("ut_math_subprocess.sh", "math", Some("subprocess"), Role::Subprocess ; "subprocess")]
    #[test_case("ut_math_shutdown.py", "math", Some("shutdown"), Role::Shutdown ; "shutdown")]
    #[test_case("ut_math_setupx.py", "math", Some("setupx"), Role::Test ; "near miss is a test")]
    fn test_file_name_grammar(name: &str, module: &str, descriptor: Option<&str>, role: Role) {
        let parsed = FileName::parse(name).unwrap();
        assert_eq!(parsed.module, module);
        assert_eq!(parsed.descriptor.as_deref(), descriptor);
        assert_eq!(parsed.role(), role);
    }

    #[test_case("math.py" ; "no prefix")]
    #[test_case("ut_math" ; "no extension")]
    #[test_case("ut_math." ; "empty extension")]
    #[test_case("ut_.py" ; "empty module")]
    #[test_case("ut__x.py" ; "empty module with descriptor")]
    #[test_case("ut_math_.py" ; "empty descriptor")]
    fn test_malformed_names(name: &str) {
        assert!(FileName::parse(name).is_err());
    }

    #[test]
    fn test_role_is_pure_function_of_name() {
        let a = TestFile::from_path(Path::new("/a/ut_net_subprocess.py")).unwrap();
        let b = TestFile::from_path(Path::new("/b/ut_net_subprocess.py")).unwrap();
        assert_eq!((a.module, a.descriptor, a.role), (b.module, b.descriptor, b.role));
    }

    #[test]
    fn test_scan_groups_modules() {
        let tmp = TempDir::new().unwrap();
        for name in [
            "ut_a_setup.py",
            "ut_a_two.py",
            "ut_a_one.py",
            "ut_a_shutdown.py",
            "ut_b.py",
            "helper.py",
            "ut_bad",
        ] {
            std::fs::write(tmp.path().join(name), "").unwrap();
        }
        std::fs::create_dir(tmp.path().join("ut_dir_x.py")).unwrap();

        let roster = Discoverer::new().scan(tmp.path()).unwrap();
        assert_eq!(roster.modules.len(), 2);

        let a = &roster.modules["a"];
        assert!(a.setup.is_some());
        assert!(a.shutdown.is_some());
        assert!(a.subprocess.is_none());
        let names: Vec<_> = a.tests.iter().map(|t| t.file_name()).collect();
        assert_eq!(names, vec!["ut_a_one.py", "ut_a_two.py"]);

        assert_eq!(roster.modules["b"].tests.len(), 1);
        assert_eq!(roster.warnings.len(), 2);
    }

    #[test]
    fn test_duplicate_lifecycle_file_marks_only_that_module() {
        let tmp = TempDir::new().unwrap();
        for name in ["ut_a_setup.py", "ut_a_setup.sh", "ut_a_x.py", "ut_b_x.py"] {
            std::fs::write(tmp.path().join(name), "").unwrap();
        }

        let roster = Discoverer::new().scan(tmp.path()).unwrap();
        assert!(!roster.modules["a"].is_runnable());
        assert!(roster.modules["a"]
            .discovery_error
            .as_deref()
            .unwrap()
            .contains("duplicate setup"));
        assert!(roster.modules["b"].is_runnable());
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_entry_is_a_warning_not_a_scan_failure() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("ut_a_x.py"), "").unwrap();
        std::os::unix::fs::symlink(
            tmp.path().join("missing-target.py"),
            tmp.path().join("ut_a_dangling.py"),
        )
        .unwrap();

        let roster = Discoverer::new().scan(tmp.path()).unwrap();
        assert_eq!(roster.test_count(), 1);
        assert_eq!(roster.warnings.len(), 1);
        assert!(roster.warnings[0].path.ends_with("ut_a_dangling.py"));
    }

    #[test]
    fn test_extension_filter() {
        let tmp = TempDir::new().unwrap();
        for name in ["ut_a_x.py", "ut_a_y.txt"] {
            std::fs::write(tmp.path().join(name), "").unwrap();
        }
        let roster = Discoverer::with_extensions(vec!["py".to_string()])
            .scan(tmp.path())
            .unwrap();
        assert_eq!(roster.test_count(), 1);
    }

    #[test]
    fn test_select_file_keeps_lifecycle() {
        let files = ["ut_a_setup.py", "ut_a_one.py", "ut_a_two.py", "ut_b.py"]
            .iter()
            .map(|n| TestFile::from_path(Path::new(n)).unwrap());
        let roster = Roster::from_files(files).select_file("ut_a_two.py").unwrap();

        assert_eq!(roster.modules.len(), 1);
        let a = &roster.modules["a"];
        assert!(a.setup.is_some());
        assert_eq!(a.tests.len(), 1);
        assert_eq!(a.tests[0].file_name(), "ut_a_two.py");
    }

    #[test]
    fn test_select_missing_module() {
        let roster = Roster::default();
        assert!(matches!(roster.select_module("nope"), Err(HarnessError::NotFound(_))));
    }

    #[test]
    fn test_scan_missing_dir() {
        let err = Discoverer::new().scan(Path::new("/definitely/not/here")).unwrap_err();
        assert!(matches!(err, HarnessError::TestDirNotFound(_)));
    }
}
