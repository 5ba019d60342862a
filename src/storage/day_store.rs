use std::{
    collections::BTreeMap,
    future::Future,
    io::ErrorKind,
    ops::Deref,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::utils::{
    clock::Clock,
    time::{date_to_partition_name, partition_name_to_date},
};

use super::{activity::Activity, cipher::StoreCipher, StorageError};

/// How many days back `get`/`update` look before falling into a full directory
/// scan. Under a sane retention policy every live partition fits inside it.
const RECENT_WINDOW_DAYS: u64 = 60;

pub const KEY_FILE_NAME: &str = "store.key";

/// Repository-shaped interface over activity persistence.
pub trait ActivityStore: Send + Sync {
    /// Stores a new activity, assigning an id if it doesn't have one yet.
    /// Returns the id under which it was stored.
    fn add(
        &self,
        activity: &mut Activity,
    ) -> impl Future<Output = Result<String, StorageError>> + Send;

    fn get(&self, id: &str) -> impl Future<Output = Result<Option<Activity>, StorageError>> + Send;

    /// Every activity whose `[start_time, end_time-or-now]` interval overlaps
    /// `[start, end]`. Order is unspecified.
    fn get_by_timerange(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Activity>, StorageError>> + Send;

    /// Rewrites a previously stored activity. Returns false if it's not found
    /// anywhere.
    fn update(&self, activity: &Activity)
        -> impl Future<Output = Result<bool, StorageError>> + Send;

    fn delete(&self, id: &str) -> impl Future<Output = Result<bool, StorageError>> + Send;

    /// Removes whole day partitions strictly older than `before`'s date.
    /// Returns the number of files deleted.
    fn cleanup_old_activities(
        &self,
        before: DateTime<Utc>,
    ) -> impl Future<Output = Result<usize, StorageError>> + Send;
}

impl<T: Deref + Send + Sync> ActivityStore for T
where
    T::Target: ActivityStore,
{
    fn add(
        &self,
        activity: &mut Activity,
    ) -> impl Future<Output = Result<String, StorageError>> + Send {
        self.deref().add(activity)
    }

    fn get(&self, id: &str) -> impl Future<Output = Result<Option<Activity>, StorageError>> + Send {
        self.deref().get(id)
    }

    fn get_by_timerange(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Activity>, StorageError>> + Send {
        self.deref().get_by_timerange(start, end)
    }

    fn update(
        &self,
        activity: &Activity,
    ) -> impl Future<Output = Result<bool, StorageError>> + Send {
        self.deref().update(activity)
    }

    fn delete(&self, id: &str) -> impl Future<Output = Result<bool, StorageError>> + Send {
        self.deref().delete(id)
    }

    fn cleanup_old_activities(
        &self,
        before: DateTime<Utc>,
    ) -> impl Future<Output = Result<usize, StorageError>> + Send {
        self.deref().cleanup_old_activities(before)
    }
}

/// Decrypted payload of a single day file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct DayPartition {
    activities: BTreeMap<String, Activity>,
}

impl DayPartition {
    fn is_empty(&self) -> bool {
        self.activities.is_empty()
    }
}

/// The main realization of [ActivityStore]: one encrypted file per UTC day,
/// keyed by each activity's `start_time` date.
pub struct DayPartitionedStore {
    base_dir: PathBuf,
    cipher: StoreCipher,
    clock: Arc<dyn Clock>,
}

impl DayPartitionedStore {
    pub fn new(base_dir: PathBuf, clock: Arc<dyn Clock>) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&base_dir)?;
        let cipher = StoreCipher::load_or_generate(&base_dir.join(KEY_FILE_NAME))?;
        Ok(Self {
            base_dir,
            cipher,
            clock,
        })
    }

    fn partition_path(&self, date: NaiveDate) -> PathBuf {
        self.base_dir.join(date_to_partition_name(date))
    }

    async fn load_partition(&self, path: &Path) -> Result<DayPartition, StorageError> {
        let payload = match fs::read(path).await {
            Ok(v) => v,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(DayPartition::default()),
            Err(e) => return Err(e.into()),
        };
        if payload.is_empty() {
            return Ok(DayPartition::default());
        }
        let plaintext = self.cipher.decrypt(&payload)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// Scan-friendly variant: an unreadable partition degrades to an empty one
    /// instead of failing the whole operation.
    async fn load_partition_or_empty(&self, path: &Path) -> DayPartition {
        match self.load_partition(path).await {
            Ok(v) => v,
            Err(e) => {
                warn!("Skipping unreadable partition {path:?}: {e}");
                DayPartition::default()
            }
        }
    }

    /// Atomic rewrite of a whole partition: temp file, read-back verification,
    /// rename over the destination. The live file is never partially written.
    async fn save_partition(
        &self,
        date: NaiveDate,
        partition: &DayPartition,
    ) -> Result<(), StorageError> {
        let path = self.partition_path(date);
        let plaintext = serde_json::to_vec(partition)?;
        let encrypted = self.cipher.encrypt(&plaintext)?;

        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, &encrypted).await?;
        let written = fs::read(&tmp).await?;
        if written != encrypted {
            let _ = fs::remove_file(&tmp).await;
            return Err(StorageError::VerificationFailed(path));
        }
        fs::rename(&tmp, &path).await?;
        debug!("Rewrote partition {path:?}");
        Ok(())
    }

    /// Dates covered by the bounded recent scan, today first.
    fn recent_dates(&self) -> impl Iterator<Item = NaiveDate> {
        let today = self.clock.time().date_naive();
        (0..RECENT_WINDOW_DAYS).filter_map(move |back| today.checked_sub_days(Days::new(back)))
    }

    async fn list_partitions(&self) -> Result<Vec<(NaiveDate, PathBuf)>, StorageError> {
        let mut entries = fs::read_dir(&self.base_dir).await?;
        let mut partitions = vec![];
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(date) = partition_name_to_date(name) {
                partitions.push((date, entry.path()));
            }
        }
        Ok(partitions)
    }
}

impl ActivityStore for DayPartitionedStore {
    async fn add(&self, activity: &mut Activity) -> Result<String, StorageError> {
        if activity.id.is_empty() {
            activity.id = Uuid::new_v4().to_string();
        }
        let date = activity.start_time.date_naive();
        let mut partition = self.load_partition(&self.partition_path(date)).await?;
        partition
            .activities
            .insert(activity.id.clone(), activity.clone());
        self.save_partition(date, &partition).await?;
        Ok(activity.id.clone())
    }

    async fn get(&self, id: &str) -> Result<Option<Activity>, StorageError> {
        for date in self.recent_dates() {
            let partition = self.load_partition_or_empty(&self.partition_path(date)).await;
            if let Some(found) = partition.activities.get(id) {
                return Ok(Some(found.clone()));
            }
        }
        // Ids should always live in the partition implied by their start_time,
        // but nothing enforces that, so fall back to scanning everything.
        for (_, path) in self.list_partitions().await? {
            let partition = self.load_partition_or_empty(&path).await;
            if let Some(found) = partition.activities.get(id) {
                return Ok(Some(found.clone()));
            }
        }
        Ok(None)
    }

    async fn get_by_timerange(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Activity>, StorageError> {
        let (start, end) = if end < start { (end, start) } else { (start, end) };
        let now = self.clock.time();
        let last = end.date_naive();

        // Partitions are keyed by start date, so a record spanning midnight or
        // one still open lives in a partition dated before the query range.
        // Every partition up to the range's last day is a candidate; the
        // interval test does the actual filtering.
        let mut results = vec![];
        for (date, path) in self.list_partitions().await? {
            if date > last {
                continue;
            }
            let partition = self.load_partition_or_empty(&path).await;
            for activity in partition.activities.into_values() {
                if activity.start_time <= end && activity.end_or(now) >= start {
                    results.push(activity);
                }
            }
        }
        Ok(results)
    }

    async fn update(&self, activity: &Activity) -> Result<bool, StorageError> {
        // start_time is immutable across updates, so its partition is checked
        // first and the recent window only on a miss.
        let implied = activity.start_time.date_naive();
        let mut dates = vec![implied];
        dates.extend(self.recent_dates().filter(|d| *d != implied));

        for date in dates {
            let mut partition = self.load_partition_or_empty(&self.partition_path(date)).await;
            if partition.activities.contains_key(&activity.id) {
                partition
                    .activities
                    .insert(activity.id.clone(), activity.clone());
                self.save_partition(date, &partition).await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        for (date, path) in self.list_partitions().await? {
            let mut partition = self.load_partition_or_empty(&path).await;
            if partition.activities.remove(id).is_some() {
                if partition.is_empty() {
                    fs::remove_file(&path).await?;
                } else {
                    self.save_partition(date, &partition).await?;
                }
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn cleanup_old_activities(&self, before: DateTime<Utc>) -> Result<usize, StorageError> {
        let cutoff = before.date_naive();
        let mut deleted = 0;
        for (date, path) in self.list_partitions().await? {
            if date < cutoff {
                fs::remove_file(&path).await?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use tempfile::tempdir;

    use crate::{
        probe::WindowSnapshot,
        storage::activity::Activity,
        utils::clock::test_support::ManualClock,
    };

    use super::{ActivityStore, DayPartitionedStore};

    fn test_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 7, 12, 0, 0).unwrap()
    }

    fn test_store(dir: &std::path::Path) -> DayPartitionedStore {
        DayPartitionedStore::new(
            dir.to_path_buf(),
            std::sync::Arc::new(ManualClock::starting_at(test_now())),
        )
        .unwrap()
    }

    fn activity_at(start: DateTime<Utc>, app: &str) -> Activity {
        Activity::begin(
            &WindowSnapshot {
                app_name: app.into(),
                window_title: format!("{app} window").into(),
                process_id: 7,
                executable_path: format!("/usr/bin/{app}").into(),
            },
            start,
        )
    }

    #[tokio::test]
    async fn test_add_get_round_trip() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path());

        let mut activity = activity_at(test_now() - Duration::hours(1), "editor");
        activity.active_time = 42.5;
        let id = store.add(&mut activity).await.unwrap();

        let restored = store.get(&id).await.unwrap().unwrap();
        assert_eq!(restored, activity);
    }

    #[tokio::test]
    async fn test_add_assigns_missing_id() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path());

        let mut activity = activity_at(test_now(), "editor");
        activity.id = String::new();
        let id = store.add(&mut activity).await.unwrap();

        assert!(!id.is_empty());
        assert_eq!(activity.id, id);
        assert!(store.get(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path());

        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reopened_store_reads_existing_data() {
        let dir = tempdir().unwrap();
        let mut activity = activity_at(test_now(), "editor");
        let id = {
            let store = test_store(dir.path());
            store.add(&mut activity).await.unwrap()
        };

        let reopened = test_store(dir.path());
        assert_eq!(reopened.get(&id).await.unwrap().unwrap(), activity);
    }

    #[tokio::test]
    async fn test_timerange_spanning_midnight() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path());

        // Starts 23:50 on March 6th, ends 00:10 on March 7th.
        let start = Utc.with_ymd_and_hms(2024, 3, 6, 23, 50, 0).unwrap();
        let mut activity = activity_at(start, "editor");
        activity.end_time = Some(Utc.with_ymd_and_hms(2024, 3, 7, 0, 10, 0).unwrap());
        store.add(&mut activity).await.unwrap();

        let day1_query = store
            .get_by_timerange(
                Utc.with_ymd_and_hms(2024, 3, 6, 20, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 3, 6, 23, 59, 0).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(day1_query.len(), 1);

        let day2_query = store
            .get_by_timerange(
                Utc.with_ymd_and_hms(2024, 3, 7, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 3, 7, 6, 0, 0).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(day2_query.len(), 1);

        let before = store
            .get_by_timerange(
                Utc.with_ymd_and_hms(2024, 3, 6, 10, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 3, 6, 12, 0, 0).unwrap(),
            )
            .await
            .unwrap();
        assert!(before.is_empty());

        let after = store
            .get_by_timerange(
                Utc.with_ymd_and_hms(2024, 3, 7, 1, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 3, 7, 2, 0, 0).unwrap(),
            )
            .await
            .unwrap();
        assert!(after.is_empty());
    }

    #[tokio::test]
    async fn test_open_activity_overlaps_until_now() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path());

        // Still open, so it occupies [start, now].
        let mut activity = activity_at(test_now() - Duration::hours(3), "editor");
        store.add(&mut activity).await.unwrap();

        let found = store
            .get_by_timerange(test_now() - Duration::hours(1), test_now())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn test_open_activity_from_earlier_day_found_by_later_query() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path());

        // Opened three days ago and never closed, so it lives in a partition
        // dated well before the queried day.
        let mut activity = activity_at(test_now() - Duration::days(3), "editor");
        store.add(&mut activity).await.unwrap();

        let found = store
            .get_by_timerange(test_now() - Duration::hours(1), test_now())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, activity.id);
    }

    #[tokio::test]
    async fn test_update_rewrites_in_place() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path());

        let mut activity = activity_at(test_now() - Duration::hours(1), "editor");
        store.add(&mut activity).await.unwrap();

        activity.end_time = Some(test_now());
        activity.active_time = 3600.0;
        assert!(store.update(&activity).await.unwrap());

        let restored = store.get(&activity.id).await.unwrap().unwrap();
        assert_eq!(restored.end_time, Some(test_now()));
        assert_eq!(restored.active_time, 3600.0);
    }

    #[tokio::test]
    async fn test_update_unknown_returns_false() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path());

        let activity = activity_at(test_now(), "editor");
        assert!(!store.update(&activity).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_removes_empty_partition_file() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path());

        let mut activity = activity_at(test_now(), "editor");
        let id = store.add(&mut activity).await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2); // partition + key

        assert!(store.delete(&id).await.unwrap());
        assert!(store.get(&id).await.unwrap().is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1); // key only

        assert!(!store.delete(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_keeps_partition_with_remaining_entries() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path());

        let mut first = activity_at(test_now(), "editor");
        let mut second = activity_at(test_now() + Duration::minutes(5), "browser");
        let first_id = store.add(&mut first).await.unwrap();
        let second_id = store.add(&mut second).await.unwrap();

        assert!(store.delete(&first_id).await.unwrap());
        assert!(store.get(&second_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_partitions_before_cutoff() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path());

        let mut old = activity_at(test_now() - Duration::days(40), "old");
        let mut middle = activity_at(test_now() - Duration::days(10), "middle");
        let mut fresh = activity_at(test_now(), "fresh");
        store.add(&mut old).await.unwrap();
        store.add(&mut middle).await.unwrap();
        store.add(&mut fresh).await.unwrap();

        let middle_path = dir.path().join(format!(
            "{}.enc",
            (test_now() - Duration::days(10)).format("%Y-%m-%d")
        ));
        let middle_bytes = std::fs::read(&middle_path).unwrap();

        let deleted = store
            .cleanup_old_activities(test_now() - Duration::days(30))
            .await
            .unwrap();

        assert_eq!(deleted, 1);
        assert!(store.get(&old.id).await.unwrap().is_none());
        assert!(store.get(&middle.id).await.unwrap().is_some());
        assert!(store.get(&fresh.id).await.unwrap().is_some());
        // Surviving partitions are untouched, byte for byte.
        assert_eq!(std::fs::read(&middle_path).unwrap(), middle_bytes);
    }

    #[tokio::test]
    async fn test_corrupted_partition_is_skipped_in_scans() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path());

        let mut activity = activity_at(test_now(), "editor");
        store.add(&mut activity).await.unwrap();

        // A partition from the previous day that can't be decrypted.
        std::fs::write(dir.path().join("2024-03-06.enc"), b"garbage").unwrap();

        let found = store
            .get_by_timerange(test_now() - Duration::days(1), test_now())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, activity.id);
    }
}
