use std::collections::BTreeMap;

/// Environment overrides supplied by the owner of a set of servers.
pub type Environment = BTreeMap<String, String>;

/// Variables whose values are search paths; engine and owner entries are concatenated rather than
/// overridden.
const PATH_LIKE: &[&str] = &["LD_PRELOAD", "LD_LIBRARY_PATH", "DYLD_LIBRARY_PATH", "PATH"];

/// Composes the environment a server is started with: the engine's own variables, overlaid with
/// the owner's. Search-path variables set by both are joined, engine entries first.
pub fn compose(engine: &[(String, String)], owner: &Environment) -> Vec<(String, String)> {
    let mut composed: BTreeMap<String, String> = engine.iter().cloned().collect();
    for (key, value) in owner {
        match composed.get_mut(key) {
            Some(existing) if PATH_LIKE.contains(&key.as_str()) => {
                existing.push(':');
                existing.push_str(value);
            }
            _ => {
                composed.insert(key.clone(), value.clone());
            }
        }
    }
    composed.into_iter().collect()
}

#[cfg(test)]
mod test {
    use super::{compose, Environment};

    fn kv(k: &str, v: &str) -> (String, String) {
        (k.to_owned(), v.to_owned())
    }

    #[test]
    fn owner_overrides_plain_variables() {
        let engine = vec![kv("MYSQL_HOME", "/engine")];
        let owner = Environment::from([kv("MYSQL_HOME", "/owner"), kv("TZ", "UTC")]);
        assert_eq!(
            compose(&engine, &owner),
            vec![kv("MYSQL_HOME", "/owner"), kv("TZ", "UTC")]
        );
    }

    #[test]
    fn preload_paths_are_joined() {
        let engine = vec![kv("LD_PRELOAD", "/lib/libeatmydata.so")];
        let owner = Environment::from([kv("LD_PRELOAD", "/lib/libfaketime.so")]);
        assert_eq!(
            compose(&engine, &owner),
            vec![kv("LD_PRELOAD", "/lib/libeatmydata.so:/lib/libfaketime.so")]
        );
    }
}
