//! Integration tests for dagcache

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn dagcache() -> Command {
        let mut cmd = cargo_bin_cmd!("dagcache");
        cmd.env_remove("DAGCACHE_CONFIG");
        cmd
    }

    /// Config pointing the store at `store` inside the temp dir
    fn write_config(dir: &Path, store: &Path) -> std::path::PathBuf {
        let path = dir.join("config.toml");
        std::fs::write(
            &path,
            format!("[store]\npath = {:?}\n", store.display().to_string()),
        )
        .unwrap();
        path
    }

    fn write_store(path: &Path, live_until: i64) {
        let doc = serde_json::json!({
            "records": {
                "stale": { "call_key": "stale", "storage_key": "s1", "expiration": 1 },
                "live": { "call_key": "live", "storage_key": "s2", "expiration": live_until },
            }
        });
        std::fs::write(path, doc.to_string()).unwrap();
    }

    #[test]
    fn help_displays() {
        dagcache()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("store"));
    }

    #[test]
    fn version_displays() {
        dagcache()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("dagcache"));
    }

    #[test]
    fn config_path() {
        dagcache()
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_init_then_show() {
        let temp = TempDir::new().unwrap();
        let config = temp.path().join("config.toml");

        dagcache()
            .arg("-c")
            .arg(&config)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration initialized"));
        assert!(config.exists());

        dagcache()
            .arg("-c")
            .arg(&config)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("sweep_interval_secs = 600"));
    }

    #[test]
    fn config_init_refuses_overwrite() {
        let temp = TempDir::new().unwrap();
        let config = temp.path().join("config.toml");
        std::fs::write(&config, "[cache]\nsweep_interval_secs = 7\n").unwrap();

        dagcache()
            .arg("-c")
            .arg(&config)
            .args(["config", "init"])
            .assert()
            .success()
            .stderr(predicate::str::contains("--force"));

        let content = std::fs::read_to_string(&config).unwrap();
        assert!(content.contains("sweep_interval_secs = 7"));
    }

    #[test]
    fn invalid_config_fails_with_hint() {
        let temp = TempDir::new().unwrap();
        let config = temp.path().join("config.toml");
        std::fs::write(&config, "[cache\n").unwrap();

        dagcache()
            .arg("-c")
            .arg(&config)
            .args(["store", "path"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"))
            .stderr(predicate::str::contains("config init --force"));
    }

    #[test]
    fn store_path_uses_configured_file() {
        let temp = TempDir::new().unwrap();
        let store = temp.path().join("exp.json");
        let config = write_config(temp.path(), &store);

        dagcache()
            .arg("-c")
            .arg(&config)
            .args(["store", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("exp.json"));
    }

    #[test]
    fn store_list_empty() {
        let temp = TempDir::new().unwrap();
        let store = temp.path().join("exp.json");
        let config = write_config(temp.path(), &store);

        dagcache()
            .arg("-c")
            .arg(&config)
            .args(["store", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No expiration records found"));
    }

    #[test]
    fn disabled_store_is_left_alone() {
        let temp = TempDir::new().unwrap();
        let store = temp.path().join("exp.json");
        write_store(&store, 1);
        let config = temp.path().join("config.toml");
        std::fs::write(
            &config,
            format!(
                "[store]\nenabled = false\npath = {:?}\n",
                store.display().to_string()
            ),
        )
        .unwrap();

        dagcache()
            .arg("-c")
            .arg(&config)
            .args(["store", "gc"])
            .assert()
            .success()
            .stdout(predicate::str::contains("disabled"));

        let content = std::fs::read_to_string(&store).unwrap();
        assert!(content.contains("stale"));
    }

    #[test]
    fn store_list_json_marks_expired() {
        let temp = TempDir::new().unwrap();
        let store = temp.path().join("exp.json");
        let config = write_config(temp.path(), &store);
        write_store(&store, i64::MAX / 2);

        let output = dagcache()
            .arg("-c")
            .arg(&config)
            .args(["store", "list", "--format", "json"])
            .output()
            .unwrap();
        assert!(output.status.success());

        let records: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        let records = records.as_array().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["call_key"], "live");
        assert_eq!(records[0]["expired"], false);
        assert_eq!(records[1]["call_key"], "stale");
        assert_eq!(records[1]["expired"], true);
    }

    #[test]
    fn store_gc_removes_expired_records() {
        let temp = TempDir::new().unwrap();
        let store = temp.path().join("exp.json");
        let config = write_config(temp.path(), &store);
        write_store(&store, i64::MAX / 2);

        dagcache()
            .arg("-c")
            .arg(&config)
            .args(["store", "gc"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Removed 1 expired record(s)"));

        dagcache()
            .arg("-c")
            .arg(&config)
            .args(["store", "list", "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::contains("live"))
            .stdout(predicate::str::contains("stale").not());
    }
}

mod cache_tests {
    use dagcache::cache::ValueBundle;
    use dagcache::store::{ExpirationStore, MemoryExpirationStore};
    use dagcache::value::Value;
    use dagcache::{Cache, CacheError, CacheKey, CallId, CallScope, SessionCache};
    use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
    use std::sync::Arc;

    fn int_value(handle: &dagcache::Handle) -> Option<i64> {
        handle.value().and_then(Value::as_int)
    }

    #[tokio::test]
    async fn released_result_is_recomputed() {
        let cache = Cache::new();
        let id = CallId::root("Query", "answer");
        let key = CacheKey::new(id.clone()).with_concurrency_key("answer");
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let (id, runs) = (id.clone(), runs.clone());
            let handle = cache
                .get_or_init_call(&CallScope::new(), key.clone(), move |_| async move {
                    runs.fetch_add(1, SeqCst);
                    Ok(ValueBundle::new(id, 42i64))
                })
                .await
                .unwrap();
            assert_eq!(int_value(&handle), Some(42));
            handle.release().await.unwrap();
        }

        // released to zero after the first call, so the second recomputes
        assert_eq!(runs.load(SeqCst), 2);
        assert_eq!(cache.size(), 0);
    }

    #[tokio::test]
    async fn held_result_serves_later_callers() {
        let cache = Cache::new();
        let id = CallId::root("Query", "answer");
        let key = CacheKey::new(id.clone());

        let first = cache
            .get_or_init_call(&CallScope::new(), key.clone(), {
                let id = id.clone();
                move |_| async move { Ok(ValueBundle::new(id, 1i64)) }
            })
            .await
            .unwrap();
        assert!(!first.hit_cache());

        let second = cache
            .get_or_init_call(&CallScope::new(), key, |_| async {
                Err::<ValueBundle, _>(CacheError::msg("should hit"))
            })
            .await
            .unwrap();
        assert!(second.hit_cache());
        assert_eq!(int_value(&second), Some(1));

        second.release().await.unwrap();
        first.release().await.unwrap();
        assert_eq!(cache.size(), 0);
    }

    #[tokio::test]
    async fn session_close_releases_tracked_results() {
        let cache = Cache::new();
        let session = SessionCache::new(cache.clone());
        let released = Arc::new(AtomicUsize::new(0));
        let id = CallId::root("Query", "thing");

        let (bundle_id, counter) = (id.clone(), released.clone());
        let handle = session
            .get_or_init_call(&CallScope::new(), CacheKey::new(id), move |_| async move {
                Ok(ValueBundle::new(bundle_id, "v").with_on_release(move || async move {
                    counter.fetch_add(1, SeqCst);
                    Ok(())
                }))
            })
            .await
            .unwrap();
        assert_eq!(handle.value().and_then(Value::as_str), Some("v"));
        assert_eq!(cache.size(), 1);

        session.release_and_close().await.unwrap();
        assert_eq!(released.load(SeqCst), 1);
        assert_eq!(cache.size(), 0);

        let err = session
            .get_or_init_call(
                &CallScope::new(),
                CacheKey::new(CallId::root("Query", "other")),
                |_| async { Err::<ValueBundle, _>(CacheError::msg("unreachable")) },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::SessionClosed));
    }

    #[tokio::test]
    async fn ttl_call_records_expiration() {
        let store = Arc::new(MemoryExpirationStore::new());
        let cache = Cache::with_store(store.clone());
        let id = CallId::root("Query", "ttl");
        let scope = CallScope::new().with_session_id("session-a");

        let bundle_id = id.clone();
        let handle = cache
            .get_or_init_call(&scope, CacheKey::new(id).with_ttl_secs(60), move |_| async move {
                Ok(ValueBundle::new(bundle_id, 5i64).with_safe_to_persist(true))
            })
            .await
            .unwrap();
        assert_eq!(int_value(&handle), Some(5));

        let records = store.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].storage_key.is_empty());
        handle.release().await.unwrap();
    }
}
