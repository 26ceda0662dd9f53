/*!
Resolves the handful of filesystem paths every other crate needs and
builds them into one immutable [`Config`] value at process start-up. No
other crate reads these paths from a global or a `lazy_static`; `Config`
is constructed once and threaded explicitly into every component that
needs it.
*/

pub mod error;

use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub use error::Error;
type Result<T, E = Error> = std::result::Result<T, E>;

const PREFERENCES_FILENAME: &str = "config.toml";

/// Process-wide, immutable bootstrap value. Built once via [`Config::load`]
/// from, in increasing priority: built-in defaults, the persisted
/// preference file, then environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of the target project this archive tracks (e.g. `"julia"`).
    /// Used to namespace database and pack names.
    pub project: String,
    /// Source mirror clone plus the source-dependency cache.
    pub downloads_dir: PathBuf,
    /// Per-database pack storage.
    pub data_dir: PathBuf,
    /// Container-runtime bundles, one subdirectory per invocation.
    pub sandbox_dir: PathBuf,
    /// Directory the preference file itself lives in.
    config_dir: PathBuf,
}

/// The only user preference this system persists: an override for where
/// [`Config::data_dir`] lives.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Preferences {
    #[serde(skip_serializing_if = "Option::is_none")]
    data_dir: Option<PathBuf>,
}

impl Config {
    /// Resolve every path for `project`, consulting the persisted
    /// preference file and environment variables along the way. The
    /// env var prefix is the upper-cased project name, e.g. `JULIA_DATA_DIR`.
    pub fn load(project: &str) -> Result<Self> {
        let home = home::home_dir().context(error::NoHomeDirSnafu)?;
        let config_dir = home.join(format!(".config/{project}-archive"));
        let cache_dir = home.join(format!(".cache/{project}-archive"));

        let prefs = Self::read_preferences(&config_dir)?;
        let env_prefix = project.to_uppercase();

        let downloads_dir = env_override(&env_prefix, "DOWNLOADS_DIR")
            .unwrap_or_else(|| cache_dir.join("downloads"));

        let data_dir = env_override(&env_prefix, "DATA_DIR")
            .or(prefs.data_dir)
            .unwrap_or_else(|| home.join(format!(".local/share/{project}-archive")));

        let sandbox_dir =
            env_override(&env_prefix, "SANDBOX_DIR").unwrap_or_else(|| cache_dir.join("sandbox"));

        for dir in [&downloads_dir, &data_dir, &sandbox_dir, &config_dir] {
            fs::create_dir_all(dir).context(error::CreateDirSnafu { path: dir })?;
        }

        Ok(Self {
            project: project.to_string(),
            downloads_dir,
            data_dir,
            sandbox_dir,
            config_dir,
        })
    }

    /// Persist an override for `data_dir` so future invocations of
    /// [`Config::load`] pick it up without an environment variable.
    pub fn set_data_dir_preference(&self, path: impl Into<PathBuf>) -> Result<()> {
        let prefs = Preferences {
            data_dir: Some(path.into()),
        };
        let rendered = toml::to_string_pretty(&prefs).context(error::SerializeSnafu)?;
        let path = self.config_dir.join(PREFERENCES_FILENAME);
        fs::write(&path, rendered).context(error::WriteSnafu { path })
    }

    fn read_preferences(config_dir: &Path) -> Result<Preferences> {
        let path = config_dir.join(PREFERENCES_FILENAME);
        match fs::read_to_string(&path) {
            Ok(raw) => toml::from_str(&raw).context(error::ParseSnafu { path }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Preferences::default()),
            Err(source) => Err(source).context(error::ReadSnafu { path }),
        }
    }

    /// Directory for one target version's database, e.g.
    /// `<data_dir>/julia-1.10[-asserts]`.
    pub fn database_dir(&self, db_name: &str) -> PathBuf {
        self.data_dir.join(db_name)
    }
}

fn env_override(prefix: &str, suffix: &str) -> Option<PathBuf> {
    env::var_os(format!("{prefix}_{suffix}")).map(PathBuf::from)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn env_override_reads_prefixed_variable() {
        let var = "ARCHIVECONFIGTEST_DATA_DIR";
        env::set_var(var, "/tmp/somewhere");
        assert_eq!(
            env_override("ARCHIVECONFIGTEST", "DATA_DIR"),
            Some(PathBuf::from("/tmp/somewhere"))
        );
        env::remove_var(var);
        assert_eq!(env_override("ARCHIVECONFIGTEST", "DATA_DIR"), None);
    }

    #[test]
    fn preferences_roundtrip_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let prefs = Preferences {
            data_dir: Some(PathBuf::from("/mnt/archive")),
        };
        let rendered = toml::to_string_pretty(&prefs).unwrap();
        fs::write(dir.path().join("config.toml"), &rendered).unwrap();

        let read_back = Config::read_preferences(dir.path()).unwrap();
        assert_eq!(read_back.data_dir, Some(PathBuf::from("/mnt/archive")));
    }

    #[test]
    fn missing_preferences_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let prefs = Config::read_preferences(dir.path()).unwrap();
        assert_eq!(prefs.data_dir, None);
    }
}
