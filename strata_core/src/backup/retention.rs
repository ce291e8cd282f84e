//! Tiered retention over a project's completed backups.
//!
//! Ages band into four tiers: everything under 3 days survives, the 3–7
//! and 7–14 day bands each keep only their newest entry, and anything 14
//! days or older is deleted.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::models::Backup;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RetentionTier {
    /// Younger than 3 days: keep all.
    Fresh,
    /// 3 to 7 days: keep newest only.
    Week,
    /// 7 to 14 days: keep newest only.
    Fortnight,
    /// 14 days or older: delete.
    Expired,
}

pub fn classify(age: Duration) -> RetentionTier {
    if age < Duration::days(3) {
        RetentionTier::Fresh
    } else if age < Duration::days(7) {
        RetentionTier::Week
    } else if age < Duration::days(14) {
        RetentionTier::Fortnight
    } else {
        RetentionTier::Expired
    }
}

/// Ids of backups a sweep should delete, given one project's completed
/// project-type backups in any order.
pub fn plan_deletions(backups: &[Backup], now: DateTime<Utc>) -> Vec<Uuid> {
    let mut ordered: Vec<&Backup> = backups.iter().collect();
    ordered.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let mut kept_week = false;
    let mut kept_fortnight = false;
    let mut deletions = Vec::new();
    for backup in ordered {
        match classify(now - backup.created_at) {
            RetentionTier::Fresh => {}
            RetentionTier::Week => {
                if kept_week {
                    deletions.push(backup.id);
                } else {
                    kept_week = true;
                }
            }
            RetentionTier::Fortnight => {
                if kept_fortnight {
                    deletions.push(backup.id);
                } else {
                    kept_fortnight = true;
                }
            }
            RetentionTier::Expired => deletions.push(backup.id),
        }
    }
    deletions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BackupFormat, BackupStatus, BackupType, ProjectId};

    fn backup_aged(project: ProjectId, now: DateTime<Utc>, age: Duration) -> Backup {
        let created_at = now - age;
        Backup {
            id: Uuid::new_v4(),
            project_id: Some(project),
            backup_type: BackupType::Project,
            table_name: None,
            object_key: format!("projects/{}/full_test.sql", project),
            size_bytes: Some(1024),
            format: BackupFormat::Sql,
            status: BackupStatus::Completed,
            error_message: None,
            retention_days: None,
            expires_at: None,
            created_by: None,
            created_at,
            completed_at: Some(created_at),
        }
    }

    #[test]
    fn tier_boundaries() {
        assert_eq!(classify(Duration::hours(1)), RetentionTier::Fresh);
        assert_eq!(classify(Duration::days(3)), RetentionTier::Week);
        assert_eq!(classify(Duration::days(7)), RetentionTier::Fortnight);
        assert_eq!(classify(Duration::days(14)), RetentionTier::Expired);
        assert_eq!(
            classify(Duration::days(3) - Duration::seconds(1)),
            RetentionTier::Fresh
        );
    }

    #[test]
    fn spec_scenario_keeps_one_per_tier() {
        // Ages: 1h, 2d, 4d, 5d, 9d, 20d. Expect 4d and 9d kept as the
        // newest of their bands; 5d, 20d deleted.
        let now = Utc::now();
        let project = ProjectId::new();
        let b_1h = backup_aged(project, now, Duration::hours(1));
        let b_2d = backup_aged(project, now, Duration::days(2));
        let b_4d = backup_aged(project, now, Duration::days(4));
        let b_5d = backup_aged(project, now, Duration::days(5));
        let b_9d = backup_aged(project, now, Duration::days(9));
        let b_20d = backup_aged(project, now, Duration::days(20));

        let all = vec![
            b_1h.clone(),
            b_2d.clone(),
            b_4d.clone(),
            b_5d.clone(),
            b_9d.clone(),
            b_20d.clone(),
        ];
        let deletions = plan_deletions(&all, now);
        assert!(deletions.contains(&b_5d.id));
        assert!(deletions.contains(&b_20d.id));
        assert_eq!(deletions.len(), 2);
        for kept in [&b_1h, &b_2d, &b_4d, &b_9d] {
            assert!(!deletions.contains(&kept.id));
        }
    }

    #[test]
    fn band_counts_hold_for_any_input() {
        let now = Utc::now();
        let project = ProjectId::new();
        // A dense spread of ages across all bands.
        let backups: Vec<Backup> = (0..40)
            .map(|i| backup_aged(project, now, Duration::hours(i * 13)))
            .collect();
        let deletions = plan_deletions(&backups, now);
        let deleted: std::collections::HashSet<Uuid> = deletions.into_iter().collect();

        let kept: Vec<&Backup> = backups.iter().filter(|b| !deleted.contains(&b.id)).collect();
        let in_band = |lo: i64, hi: i64| {
            kept.iter()
                .filter(|b| {
                    let age = now - b.created_at;
                    age >= Duration::days(lo) && age < Duration::days(hi)
                })
                .count()
        };
        // All fresh backups survive.
        let fresh_total = backups
            .iter()
            .filter(|b| now - b.created_at < Duration::days(3))
            .count();
        assert_eq!(in_band(0, 3), fresh_total);
        assert!(in_band(3, 7) <= 1);
        assert!(in_band(7, 14) <= 1);
        assert_eq!(in_band(14, i64::MAX / 2), 0);
    }

    #[test]
    fn order_of_input_does_not_matter() {
        let now = Utc::now();
        let project = ProjectId::new();
        let mut backups: Vec<Backup> = (0..10)
            .map(|i| backup_aged(project, now, Duration::days(i)))
            .collect();
        let forward = plan_deletions(&backups, now);
        backups.reverse();
        let mut reversed = plan_deletions(&backups, now);
        let mut forward = forward;
        forward.sort();
        reversed.sort();
        assert_eq!(forward, reversed);
    }
}
