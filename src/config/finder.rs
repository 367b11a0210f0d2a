use crate::config::defaults::bundled_config_dir;
use crate::config::loader::{ConfigLoader, MissingProbe, ReloadCallback};
use crate::config::merge::{merge_layers, merge_values};
use crate::error::{PowerlineError, Result};
use serde_json::{Map, Value};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Config search directories, lowest precedence first.
pub fn get_config_paths() -> Vec<PathBuf> {
    if let Some(paths) = env::var_os("POWERLINE_CONFIG_PATHS") {
        return env::split_paths(&paths)
            .filter(|p| !p.as_os_str().is_empty())
            .collect();
    }

    let mut paths = vec![bundled_config_dir()];

    let system_dirs = env::var("XDG_CONFIG_DIRS").unwrap_or_else(|_| "/etc/xdg".to_string());
    let mut system: Vec<PathBuf> = system_dirs
        .split(':')
        .filter(|d| !d.is_empty())
        .map(|d| Path::new(d).join("powerline"))
        .filter(|p| p.is_dir())
        .collect();
    // XDG lists the most important directory first.
    system.reverse();
    paths.extend(system);

    let user_dir = env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(dirs::config_dir)
        .or_else(|| dirs::home_dir().map(|home| home.join(".config")));
    if let Some(user_dir) = user_dir {
        let user_dir = user_dir.join("powerline");
        if user_dir.is_dir() {
            paths.push(user_dir);
        }
    }

    paths
}

fn file_probe() -> MissingProbe {
    Arc::new(|key: &Path| Ok(key.is_file().then(|| key.to_path_buf())))
}

/// Looks up `<dir>/<name>.json` across the search path.
#[derive(Debug, Clone)]
pub struct ConfigFinder {
    paths: Vec<PathBuf>,
}

impl ConfigFinder {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }

    pub fn from_env() -> Self {
        Self::new(get_config_paths())
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    fn describe_paths(&self) -> String {
        self.paths
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Every existing `<dir>/<name>.json`, lowest precedence first.
    ///
    /// With a callback, found files are watched and every directory lacking
    /// the file gets a missing-probe so the file is picked up once created.
    pub fn find_config_files(
        &self,
        name: &str,
        loader: &ConfigLoader,
        callback: Option<&ReloadCallback>,
    ) -> Result<Vec<PathBuf>> {
        let file_name = format!("{}.json", name);
        let mut found = Vec::new();
        for dir in &self.paths {
            let candidate = dir.join(&file_name);
            if candidate.is_file() {
                if let Some(callback) = callback {
                    loader.register(callback.clone(), &candidate);
                }
                found.push(candidate);
            } else if let Some(callback) = callback {
                loader.register_missing(file_probe(), callback.clone(), &candidate);
            }
        }
        if found.is_empty() {
            return Err(PowerlineError::ConfigNotFound {
                name: name.to_string(),
                paths: self.describe_paths(),
            });
        }
        Ok(found)
    }

    /// Merge every match of `name` into one document, higher precedence
    /// winning key by key.
    pub fn load_config(
        &self,
        name: &str,
        loader: &ConfigLoader,
        callback: Option<&ReloadCallback>,
    ) -> Result<Value> {
        let files = self.find_config_files(name, loader, callback)?;
        let layers = files
            .iter()
            .map(|path| loader.load(path))
            .collect::<Result<Vec<_>>>()?;
        Ok(merge_layers(layers.iter()))
    }

    /// Merge several levels (e.g. `themes/powerline`, `themes/shell/__main__`,
    /// `themes/shell/default`). Levels listed in `optional` may be missing;
    /// a missing mandatory level is an error.
    pub fn load_hierarchical(
        &self,
        levels: &[String],
        optional: &[usize],
        loader: &ConfigLoader,
        callback: Option<&ReloadCallback>,
    ) -> Result<Value> {
        let mut merged = Value::Object(Map::new());
        let mut loaded_any = false;
        for (index, level) in levels.iter().enumerate() {
            match self.load_config(level, loader, callback) {
                Ok(layer) => {
                    merge_values(&mut merged, &layer);
                    loaded_any = true;
                }
                Err(e) if e.is_not_found() && optional.contains(&index) => {}
                Err(e) => return Err(e),
            }
        }
        if !loaded_any {
            return Err(PowerlineError::ConfigNotFound {
                name: levels.join(", "),
                paths: self.describe_paths(),
            });
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, content: &str) {
        let path = dir.join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_layers_merge_with_later_paths_winning() {
        let system = TempDir::new().unwrap();
        let user = TempDir::new().unwrap();
        write(system.path(), "config.json", r#"{"common": {"spaces": 1, "watcher": "auto"}}"#);
        write(user.path(), "config.json", r#"{"common": {"spaces": 2}}"#);

        let finder = ConfigFinder::new(vec![system.path().to_path_buf(), user.path().to_path_buf()]);
        let loader = ConfigLoader::new(true);
        let config = finder.load_config("config", &loader, None).unwrap();
        assert_eq!(config, json!({"common": {"spaces": 2, "watcher": "auto"}}));
    }

    #[test]
    fn test_missing_everywhere_lists_search_paths() {
        let dir = TempDir::new().unwrap();
        let finder = ConfigFinder::new(vec![dir.path().to_path_buf()]);
        let loader = ConfigLoader::new(true);
        let err = finder.find_config_files("colors", &loader, None).unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains(&dir.path().display().to_string()));
    }

    #[test]
    fn test_absent_layers_get_missing_probes() {
        let system = TempDir::new().unwrap();
        let user = TempDir::new().unwrap();
        write(system.path(), "colors.json", "{}");

        let finder = ConfigFinder::new(vec![system.path().to_path_buf(), user.path().to_path_buf()]);
        let loader = ConfigLoader::new(false);
        let callback = ReloadCallback::new(|_| {});
        finder.find_config_files("colors", &loader, Some(&callback)).unwrap();
        assert_eq!(loader.watched_paths(), vec![system.path().join("colors.json")]);
        assert_eq!(loader.missing_keys(), vec![user.path().join("colors.json")]);
    }

    #[test]
    fn test_hierarchical_optional_levels() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "themes/powerline.json", r#"{"spaces": 1, "outer_padding": 1}"#);
        write(dir.path(), "themes/shell/default.json", r#"{"spaces": 0}"#);

        let finder = ConfigFinder::new(vec![dir.path().to_path_buf()]);
        let loader = ConfigLoader::new(true);
        let levels = vec![
            "themes/powerline".to_string(),
            "themes/shell/__main__".to_string(),
            "themes/shell/default".to_string(),
        ];
        let theme = finder.load_hierarchical(&levels, &[0, 1], &loader, None).unwrap();
        assert_eq!(theme, json!({"spaces": 0, "outer_padding": 1}));

        let missing = vec!["themes/shell/__main__".to_string(), "themes/shell/nope".to_string()];
        assert!(finder.load_hierarchical(&missing, &[0], &loader, None).is_err());
    }
}
