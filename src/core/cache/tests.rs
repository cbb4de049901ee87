use super::*;
use crate::core::store::Record;
use serde_json::json;
use tempfile::TempDir;

fn setup() -> (TempDir, PathCache) {
    let tmp = TempDir::new().unwrap();
    let cache = PathCache::open_at(tmp.path()).unwrap();
    (tmp, cache)
}

fn tag_dir(cache: &PathCache, rel: &str, key: &EntityKey) -> PathBuf {
    let dir = cache.root().join(rel);
    fs::create_dir_all(&dir).unwrap();
    let record: Record = json!({"type": key.entity_type, "id": key.id})
        .as_object()
        .unwrap()
        .clone();
    tags::add_tag(&dir, &record).unwrap();
    dir
}

#[test]
fn test_put_then_get_returns_absolute_path() {
    let (_tmp, mut cache) = setup();
    let key = EntityKey::new("Shot", 1);
    let dir = tag_dir(&cache, "SEQ/AA/AA_001", &key);

    cache.put(&key, &dir).unwrap();
    assert_eq!(cache.get(&key).unwrap(), Some(dir));
}

#[test]
fn test_put_accepts_relative_paths() {
    let (_tmp, mut cache) = setup();
    let key = EntityKey::new("Shot", 1);
    let dir = tag_dir(&cache, "SEQ/AA/AA_001", &key);

    cache.put(&key, Path::new("SEQ/AA/AA_001")).unwrap();
    assert_eq!(cache.get(&key).unwrap(), Some(dir));
    assert_eq!(cache.entries().unwrap()[0].path, "SEQ/AA/AA_001");
}

#[test]
fn test_get_is_miss_when_tag_removed() {
    let (_tmp, mut cache) = setup();
    let key = EntityKey::new("Shot", 1);
    let dir = tag_dir(&cache, "SEQ/AA/AA_001", &key);
    cache.put(&key, &dir).unwrap();

    fs::remove_file(tags::tag_path(&dir)).unwrap();

    assert_eq!(cache.get(&key).unwrap(), None);
    // The row itself is left for rebuild to reconcile
    assert_eq!(cache.cached_path(&key).unwrap(), Some(dir));
}

#[test]
fn test_get_is_miss_when_directory_deleted() {
    let (_tmp, mut cache) = setup();
    let key = EntityKey::new("Shot", 1);
    let dir = tag_dir(&cache, "gone", &key);
    cache.put(&key, &dir).unwrap();
    fs::remove_dir_all(&dir).unwrap();

    assert_eq!(cache.get(&key).unwrap(), None);
}

#[test]
fn test_get_is_miss_when_tagged_with_other_entity() {
    let (_tmp, mut cache) = setup();
    let key = EntityKey::new("Shot", 1);
    let dir = tag_dir(&cache, "SEQ/AA/AA_001", &EntityKey::new("Shot", 2));
    cache.put(&key, &dir).unwrap();

    assert_eq!(cache.get(&key).unwrap(), None);
}

#[test]
fn test_put_outside_root_is_rejected() {
    let (_tmp, mut cache) = setup();
    let other = TempDir::new().unwrap();
    let err = cache
        .put(&EntityKey::new("Shot", 1), other.path())
        .unwrap_err();
    assert!(matches!(err, CacheError::OutsideRoot { .. }));
}

#[test]
fn test_put_replaces_existing_row() {
    let (_tmp, mut cache) = setup();
    let key = EntityKey::new("Shot", 1);
    cache.put(&key, Path::new("a")).unwrap();
    cache.put(&key, Path::new("b")).unwrap();

    let entries = cache.entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].path, "b");
}

#[test]
fn test_delete() {
    let (_tmp, mut cache) = setup();
    let key = EntityKey::new("Shot", 1);
    cache.put(&key, Path::new("a")).unwrap();

    assert!(cache.delete(&key).unwrap());
    assert!(!cache.delete(&key).unwrap());
    assert_eq!(cache.cached_path(&key).unwrap(), None);
}

#[test]
fn test_iter_merges_into_session() {
    let (_tmp, mut cache) = setup();
    cache.put(&EntityKey::new("Shot", 1), Path::new("a")).unwrap();
    cache.put(&EntityKey::new("Task", 2), Path::new("a/b")).unwrap();

    let mut session = Session::new();
    let entities = cache.iter(&mut session).unwrap();
    assert_eq!(entities.len(), 2);
    assert!(session.lookup(&EntityKey::new("Task", 2)).is_some());
}

#[test]
fn test_walk_filters_by_subpath_type_and_freshness() {
    let (_tmp, mut cache) = setup();
    let shot = EntityKey::new("Shot", 1);
    let task = EntityKey::new("Task", 2);
    let other = EntityKey::new("Shot", 3);
    let shot_dir = tag_dir(&cache, "SEQ/AA/AA_001", &shot);
    cache.put(&shot, &shot_dir).unwrap();
    cache.put(&task, Path::new("SEQ/AA/AA_001/anim")).unwrap();
    cache.put(&other, Path::new("SEQ/AB/AB_001")).unwrap();

    let mut session = Session::new();
    let all = cache
        .walk(&mut session, Path::new("SEQ/AA"), None, false)
        .unwrap();
    assert_eq!(all.len(), 2);

    let shots = cache
        .walk(&mut session, Path::new("SEQ"), Some("Shot"), false)
        .unwrap();
    assert_eq!(shots.len(), 2);

    // The task and AB_001 directories were never created
    let fresh = cache
        .walk(&mut session, Path::new("SEQ"), None, true)
        .unwrap();
    assert_eq!(fresh.len(), 1);
    assert_eq!(fresh[0].0, shot_dir);
}

#[test]
fn test_walk_does_not_match_name_prefixes() {
    let (_tmp, mut cache) = setup();
    cache.put(&EntityKey::new("Shot", 1), Path::new("SEQ/AA_1")).unwrap();

    let mut session = Session::new();
    let found = cache
        .walk(&mut session, Path::new("SEQ/AA"), None, false)
        .unwrap();
    assert!(found.is_empty());
}

#[test]
fn test_statistics_and_clear() {
    let (_tmp, mut cache) = setup();
    cache.put(&EntityKey::new("Shot", 1), Path::new("a")).unwrap();
    cache.put(&EntityKey::new("Shot", 2), Path::new("b")).unwrap();
    cache.put(&EntityKey::new("Task", 3), Path::new("c")).unwrap();

    let stats = cache.statistics().unwrap();
    assert_eq!(stats.total_entries, 3);
    assert_eq!(stats.by_type.get("Shot"), Some(&2));

    cache.clear().unwrap();
    assert_eq!(cache.statistics().unwrap().total_entries, 0);
}

#[test]
fn test_rebuild_from_tags() {
    let (_tmp, mut cache) = setup();
    let shot = EntityKey::new("Shot", 1);
    let task = EntityKey::new("Task", 2);
    let shot_dir = tag_dir(&cache, "SEQ/AA/AA_001", &shot);
    let task_dir = tag_dir(&cache, "SEQ/AA/AA_001/anim", &task);
    cache.put(&EntityKey::new("Shot", 99), Path::new("stale")).unwrap();

    let stats = cache.rebuild().unwrap();
    assert_eq!(stats.entries_indexed, 2);
    assert_eq!(cache.get(&shot).unwrap(), Some(shot_dir));
    assert_eq!(cache.get(&task).unwrap(), Some(task_dir));
    assert_eq!(cache.cached_path(&EntityKey::new("Shot", 99)).unwrap(), None);
}

#[test]
fn test_reopen_keeps_rows() {
    let tmp = TempDir::new().unwrap();
    {
        let mut cache = PathCache::open_at(tmp.path()).unwrap();
        cache.put(&EntityKey::new("Shot", 1), Path::new("a")).unwrap();
    }
    let cache = PathCache::open_at(tmp.path()).unwrap();
    assert_eq!(cache.entries().unwrap().len(), 1);
}

#[cfg(unix)]
#[test]
fn test_database_is_world_writable() {
    use std::os::unix::fs::PermissionsExt;

    let (tmp, _cache) = setup();
    let mode = fs::metadata(tmp.path().join(CACHE_FILE))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o666, 0o666);
}
