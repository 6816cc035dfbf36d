//! PostgreSQL-backed store using sqlx.
//!
//! Cohort isolation uses transaction-scoped advisory locks keyed by
//! [`cohort_lock_key`], so concurrent submissions to one cohort queue up while
//! other cohorts proceed in parallel.
//!
//! This module is only available when the `sql` feature is enabled.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};

use crate::error::RunboardError;
use crate::hash::cohort_lock_key;
use crate::model::{
    Activity, Checkpoint, Follow, MapInfo, MapNotify, NewMap, NewRun, NewSession, Notification,
    RankEntry, RankUpdate, RunRecord, RunSession, Subscriber, TrackInfo, TrackStats, UserMapRank,
    UserRecord, UserStats,
};
use crate::store::{Store, StoreTransaction, StoredXpConfig};
use crate::types::{
    ActivityFlags, ActivityId, ActivityType, CohortKey, MapId, NotificationId, RunFlags, RunId,
    SessionId, TrackId, UserId,
};

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct SqlStore {
    pool: PgPool,
}

impl SqlStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, RunboardError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| RunboardError::persistence(format!("failed to connect: {e}"), e))?;
        Ok(Self::new(pool))
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> Result<(), RunboardError> {
        sqlx::migrate!()
            .run(&self.pool)
            .await
            .map_err(|e| RunboardError::persistence(format!("migration failed: {e}"), e))
    }
}

#[async_trait]
impl Store for SqlStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, RunboardError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(db_err("begin transaction"))?;
        Ok(Box::new(SqlTransaction { tx }))
    }
}

struct SqlTransaction {
    tx: Transaction<'static, Postgres>,
}

fn db_err(op: &'static str) -> impl FnOnce(sqlx::Error) -> RunboardError {
    move |e| RunboardError::persistence(format!("{op} failed: {e}"), e)
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T, RunboardError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name).map_err(|e| {
        RunboardError::persistence(format!("failed to decode column {name}: {e}"), e)
    })
}

fn small(row: &PgRow, name: &str) -> Result<u8, RunboardError> {
    let value: i16 = column(row, name)?;
    u8::try_from(value).map_err(|e| {
        RunboardError::persistence(format!("column {name} out of range: {value}"), e)
    })
}

fn unsigned(row: &PgRow, name: &str) -> Result<u64, RunboardError> {
    let value: i64 = column(row, name)?;
    u64::try_from(value).map_err(|e| {
        RunboardError::persistence(format!("column {name} out of range: {value}"), e)
    })
}

fn cohort_from_row(row: &PgRow) -> Result<CohortKey, RunboardError> {
    let flags: i32 = column(row, "flags")?;
    Ok(CohortKey::new(
        MapId(column(row, "map_id")?),
        small(row, "track_num")?,
        small(row, "zone_num")?,
        RunFlags::from_bits_retain(flags as u32),
    ))
}

fn session_from_row(row: &PgRow) -> Result<RunSession, RunboardError> {
    Ok(RunSession {
        id: SessionId(column(row, "id")?),
        user_id: UserId(column(row, "user_id")?),
        map_id: MapId(column(row, "map_id")?),
        track_id: TrackId(column(row, "track_id")?),
        track_num: small(row, "track_num")?,
        zone_num: small(row, "zone_num")?,
        created_at: column(row, "created_at")?,
    })
}

fn run_from_row(row: &PgRow) -> Result<RunRecord, RunboardError> {
    let ticks = unsigned(row, "ticks")?;
    Ok(RunRecord {
        id: RunId(column(row, "id")?),
        user_id: UserId(column(row, "user_id")?),
        cohort: cohort_from_row(row)?,
        ticks: u32::try_from(ticks).map_err(|e| {
            RunboardError::persistence(format!("run ticks out of range: {ticks}"), e)
        })?,
        tick_rate: column(row, "tick_rate")?,
        time: column(row, "time")?,
        hash: column(row, "hash")?,
        file_ref: column(row, "file_ref")?,
        created_at: column(row, "created_at")?,
    })
}

fn rank_from_row(row: &PgRow) -> Result<UserMapRank, RunboardError> {
    let rank: i32 = column(row, "rank")?;
    Ok(UserMapRank {
        cohort: cohort_from_row(row)?,
        user_id: UserId(column(row, "user_id")?),
        run_id: RunId(column(row, "run_id")?),
        rank: rank.max(0) as u32,
        rank_xp: column(row, "rank_xp")?,
    })
}

fn notification_from_row(row: &PgRow) -> Result<Notification, RunboardError> {
    Ok(Notification {
        id: NotificationId(column(row, "id")?),
        user_id: UserId(column(row, "user_id")?),
        activity_id: ActivityId(column(row, "activity_id")?),
        read: column(row, "read")?,
        created_at: column(row, "created_at")?,
    })
}

fn subscriber_from_row(row: &PgRow) -> Result<Subscriber, RunboardError> {
    let notify_on: i32 = column(row, "notify_on")?;
    Ok(Subscriber {
        user_id: UserId(column(row, "user_id")?),
        notify_on: ActivityFlags::from_bits_truncate(notify_on as u32),
    })
}

const COHORT_FILTER: &str = "map_id = $1 AND track_num = $2 AND zone_num = $3 AND flags = $4";

#[async_trait]
impl StoreTransaction for SqlTransaction {
    async fn insert_user(
        &mut self,
        alias: &str,
        steam_id: &str,
    ) -> Result<UserRecord, RunboardError> {
        let row = sqlx::query(
            "INSERT INTO users (alias, steam_id) VALUES ($1, $2)
             ON CONFLICT (steam_id) DO NOTHING
             RETURNING id",
        )
        .bind(alias)
        .bind(steam_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err("insert user"))?
        .ok_or_else(|| {
            RunboardError::conflict(format!("steam id {steam_id} already registered"))
        })?;

        Ok(UserRecord {
            id: UserId(column(&row, "id")?),
            alias: alias.to_string(),
            steam_id: steam_id.to_string(),
        })
    }

    async fn user(&mut self, id: UserId) -> Result<Option<UserRecord>, RunboardError> {
        let row = sqlx::query("SELECT id, alias, steam_id FROM users WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err("load user"))?;
        row.map(|row| {
            Ok(UserRecord {
                id: UserId(column(&row, "id")?),
                alias: column(&row, "alias")?,
                steam_id: column(&row, "steam_id")?,
            })
        })
        .transpose()
    }

    async fn insert_map(&mut self, map: &NewMap) -> Result<MapInfo, RunboardError> {
        let row = sqlx::query("INSERT INTO maps (name, hash) VALUES ($1, $2) RETURNING id")
            .bind(&map.name)
            .bind(&map.hash)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(db_err("insert map"))?;
        let id = MapId(column(&row, "id")?);

        let mut tracks = Vec::with_capacity(map.tracks.len());
        for track in &map.tracks {
            let row = sqlx::query(
                "INSERT INTO map_tracks (map_id, track_num, num_zones, difficulty, is_linear)
                 VALUES ($1, $2, $3, $4, $5)
                 RETURNING id",
            )
            .bind(id.0)
            .bind(track.track_num as i16)
            .bind(track.num_zones as i16)
            .bind(track.difficulty as i16)
            .bind(track.is_linear)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(db_err("insert track"))?;
            tracks.push(TrackInfo {
                id: TrackId(column(&row, "id")?),
                track_num: track.track_num,
                num_zones: track.num_zones,
                difficulty: track.difficulty,
                is_linear: track.is_linear,
            });
        }

        Ok(MapInfo {
            id,
            name: map.name.clone(),
            hash: map.hash.clone(),
            tracks,
        })
    }

    async fn map(&mut self, id: MapId) -> Result<Option<MapInfo>, RunboardError> {
        let Some(row) = sqlx::query("SELECT id, name, hash FROM maps WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err("load map"))?
        else {
            return Ok(None);
        };

        let track_rows = sqlx::query(
            "SELECT id, track_num, num_zones, difficulty, is_linear
             FROM map_tracks WHERE map_id = $1 ORDER BY track_num",
        )
        .bind(id.0)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err("load tracks"))?;

        let tracks = track_rows
            .iter()
            .map(|r| {
                Ok(TrackInfo {
                    id: TrackId(column(r, "id")?),
                    track_num: small(r, "track_num")?,
                    num_zones: small(r, "num_zones")?,
                    difficulty: small(r, "difficulty")?,
                    is_linear: column(r, "is_linear")?,
                })
            })
            .collect::<Result<Vec<_>, RunboardError>>()?;

        Ok(Some(MapInfo {
            id,
            name: column(&row, "name")?,
            hash: column(&row, "hash")?,
            tracks,
        }))
    }

    async fn follow(&mut self, follow: Follow) -> Result<(), RunboardError> {
        sqlx::query(
            "INSERT INTO follows (follower_id, followed_id, notify_on) VALUES ($1, $2, $3)
             ON CONFLICT (follower_id, followed_id) DO UPDATE SET notify_on = EXCLUDED.notify_on",
        )
        .bind(follow.follower_id.0)
        .bind(follow.followed_id.0)
        .bind(follow.notify_on.bits() as i32)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err("save follow"))?;
        Ok(())
    }

    async fn subscribe_map(&mut self, sub: MapNotify) -> Result<(), RunboardError> {
        sqlx::query(
            "INSERT INTO map_notifies (user_id, map_id, notify_on) VALUES ($1, $2, $3)
             ON CONFLICT (user_id, map_id) DO UPDATE SET notify_on = EXCLUDED.notify_on",
        )
        .bind(sub.user_id.0)
        .bind(sub.map_id.0)
        .bind(sub.notify_on.bits() as i32)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err("save map subscription"))?;
        Ok(())
    }

    async fn delete_user_sessions(&mut self, user: UserId) -> Result<u64, RunboardError> {
        // the user row lock queues concurrent session swaps for one user
        sqlx::query("SELECT id FROM users WHERE id = $1 FOR UPDATE")
            .bind(user.0)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err("lock user"))?;
        let result = sqlx::query("DELETE FROM run_sessions WHERE user_id = $1")
            .bind(user.0)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err("delete user sessions"))?;
        Ok(result.rows_affected())
    }

    async fn insert_session(&mut self, session: &NewSession) -> Result<RunSession, RunboardError> {
        let row = sqlx::query(
            "INSERT INTO run_sessions (user_id, map_id, track_id, track_num, zone_num)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING id, user_id, map_id, track_id, track_num, zone_num, created_at",
        )
        .bind(session.user_id.0)
        .bind(session.map_id.0)
        .bind(session.track_id.0)
        .bind(session.track_num as i16)
        .bind(session.zone_num as i16)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err("insert session"))?;
        session_from_row(&row)
    }

    async fn session(
        &mut self,
        id: SessionId,
        user: UserId,
    ) -> Result<Option<RunSession>, RunboardError> {
        sqlx::query("SELECT * FROM run_sessions WHERE id = $1 AND user_id = $2")
            .bind(id.0)
            .bind(user.0)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err("load session"))?
            .as_ref()
            .map(session_from_row)
            .transpose()
    }

    async fn user_session(&mut self, user: UserId) -> Result<Option<RunSession>, RunboardError> {
        sqlx::query("SELECT * FROM run_sessions WHERE user_id = $1 ORDER BY id DESC LIMIT 1")
            .bind(user.0)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err("load user session"))?
            .as_ref()
            .map(session_from_row)
            .transpose()
    }

    async fn delete_session(&mut self, id: SessionId) -> Result<(), RunboardError> {
        sqlx::query("DELETE FROM run_sessions WHERE id = $1")
            .bind(id.0)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err("delete session"))?;
        Ok(())
    }

    async fn insert_checkpoint(
        &mut self,
        session: SessionId,
        zone: u8,
        tick: u32,
    ) -> Result<bool, RunboardError> {
        let result = sqlx::query(
            "INSERT INTO run_session_checkpoints (session_id, zone, tick) VALUES ($1, $2, $3)
             ON CONFLICT (session_id, zone) DO NOTHING",
        )
        .bind(session.0)
        .bind(zone as i16)
        .bind(tick as i64)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err("insert checkpoint"))?;
        Ok(result.rows_affected() == 1)
    }

    async fn checkpoints(&mut self, session: SessionId) -> Result<Vec<Checkpoint>, RunboardError> {
        let rows = sqlx::query(
            "SELECT session_id, zone, tick, created_at FROM run_session_checkpoints
             WHERE session_id = $1 ORDER BY zone",
        )
        .bind(session.0)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err("load checkpoints"))?;

        rows.iter()
            .map(|row| {
                let tick = unsigned(row, "tick")?;
                Ok(Checkpoint {
                    session_id: SessionId(column(row, "session_id")?),
                    zone: small(row, "zone")?,
                    tick: u32::try_from(tick).map_err(|e| {
                        RunboardError::persistence(
                            format!("checkpoint tick out of range: {tick}"),
                            e,
                        )
                    })?,
                    created_at: column(row, "created_at")?,
                })
            })
            .collect()
    }

    async fn lock_cohort(&mut self, cohort: &CohortKey) -> Result<(), RunboardError> {
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(cohort_lock_key(cohort))
            .execute(&mut *self.tx)
            .await
            .map_err(db_err("lock cohort"))?;
        Ok(())
    }

    async fn best_time(
        &mut self,
        cohort: &CohortKey,
        user: Option<UserId>,
    ) -> Result<Option<f64>, RunboardError> {
        let row = sqlx::query(&format!(
            "SELECT MIN(time) AS best FROM runs
             WHERE {COHORT_FILTER} AND ($5::BIGINT IS NULL OR user_id = $5)"
        ))
        .bind(cohort.map_id.0)
        .bind(cohort.track_num as i16)
        .bind(cohort.zone_num as i16)
        .bind(cohort.flags.bits() as i32)
        .bind(user.map(|u| u.0))
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err("load best time"))?;
        column(&row, "best")
    }

    async fn run_hash_exists(&mut self, user: UserId, hash: &str) -> Result<bool, RunboardError> {
        let row = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM runs WHERE user_id = $1 AND hash = $2) AS found",
        )
        .bind(user.0)
        .bind(hash)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err("check run hash"))?;
        column(&row, "found")
    }

    async fn has_completed(
        &mut self,
        user: UserId,
        map: MapId,
        track_num: u8,
        zone_num: u8,
    ) -> Result<bool, RunboardError> {
        let row = sqlx::query(
            "SELECT EXISTS (
                 SELECT 1 FROM runs
                 WHERE user_id = $1 AND map_id = $2 AND track_num = $3 AND zone_num = $4
             ) AS found",
        )
        .bind(user.0)
        .bind(map.0)
        .bind(track_num as i16)
        .bind(zone_num as i16)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err("check completion"))?;
        column(&row, "found")
    }

    async fn insert_run(&mut self, run: &NewRun) -> Result<RunRecord, RunboardError> {
        let row = sqlx::query(
            "INSERT INTO runs
                 (user_id, map_id, track_num, zone_num, flags, ticks, tick_rate, time,
                  hash, file_ref)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             RETURNING id, created_at",
        )
        .bind(run.user_id.0)
        .bind(run.cohort.map_id.0)
        .bind(run.cohort.track_num as i16)
        .bind(run.cohort.zone_num as i16)
        .bind(run.cohort.flags.bits() as i32)
        .bind(run.ticks as i64)
        .bind(run.tick_rate)
        .bind(run.time())
        .bind(&run.hash)
        .bind(&run.file_ref)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err("insert run"))?;

        let created_at: DateTime<Utc> = column(&row, "created_at")?;
        Ok(RunRecord {
            id: RunId(column(&row, "id")?),
            user_id: run.user_id,
            cohort: run.cohort,
            ticks: run.ticks,
            tick_rate: run.tick_rate,
            time: run.time(),
            hash: run.hash.clone(),
            file_ref: run.file_ref.clone(),
            created_at,
        })
    }

    async fn run(&mut self, id: RunId) -> Result<Option<RunRecord>, RunboardError> {
        sqlx::query("SELECT * FROM runs WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err("load run"))?
            .as_ref()
            .map(run_from_row)
            .transpose()
    }

    async fn upsert_rank(
        &mut self,
        cohort: &CohortKey,
        user: UserId,
        run: RunId,
    ) -> Result<(), RunboardError> {
        sqlx::query(
            "INSERT INTO user_map_ranks
                 (map_id, track_num, zone_num, flags, user_id, run_id, rank, rank_xp)
             VALUES ($1, $2, $3, $4, $5, $6, 0, 0)
             ON CONFLICT (map_id, track_num, zone_num, flags, user_id)
             DO UPDATE SET run_id = EXCLUDED.run_id",
        )
        .bind(cohort.map_id.0)
        .bind(cohort.track_num as i16)
        .bind(cohort.zone_num as i16)
        .bind(cohort.flags.bits() as i32)
        .bind(user.0)
        .bind(run.0)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err("upsert rank"))?;
        Ok(())
    }

    async fn rank_entries(&mut self, cohort: &CohortKey) -> Result<Vec<RankEntry>, RunboardError> {
        let rows = sqlx::query(
            "SELECT r.map_id, r.track_num, r.zone_num, r.flags, r.user_id, r.run_id,
                    r.rank, r.rank_xp, runs.time, runs.created_at AS run_created_at
             FROM user_map_ranks r
             JOIN runs ON runs.id = r.run_id
             WHERE r.map_id = $1 AND r.track_num = $2 AND r.zone_num = $3 AND r.flags = $4",
        )
        .bind(cohort.map_id.0)
        .bind(cohort.track_num as i16)
        .bind(cohort.zone_num as i16)
        .bind(cohort.flags.bits() as i32)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err("load cohort ranks"))?;

        rows.iter()
            .map(|row| {
                Ok(RankEntry {
                    rank: rank_from_row(row)?,
                    time: column(row, "time")?,
                    run_created_at: column(row, "run_created_at")?,
                })
            })
            .collect()
    }

    async fn update_ranks(
        &mut self,
        cohort: &CohortKey,
        updates: &[RankUpdate],
    ) -> Result<(), RunboardError> {
        if updates.is_empty() {
            return Ok(());
        }
        let users: Vec<i64> = updates.iter().map(|u| u.user_id.0).collect();
        let ranks: Vec<i32> = updates.iter().map(|u| u.rank as i32).collect();
        let xp: Vec<f64> = updates.iter().map(|u| u.rank_xp).collect();

        sqlx::query(
            "UPDATE user_map_ranks AS r
             SET rank = u.rank, rank_xp = u.rank_xp
             FROM UNNEST($5::BIGINT[], $6::INTEGER[], $7::DOUBLE PRECISION[])
                  AS u(user_id, rank, rank_xp)
             WHERE r.map_id = $1 AND r.track_num = $2 AND r.zone_num = $3 AND r.flags = $4
               AND r.user_id = u.user_id",
        )
        .bind(cohort.map_id.0)
        .bind(cohort.track_num as i16)
        .bind(cohort.zone_num as i16)
        .bind(cohort.flags.bits() as i32)
        .bind(users)
        .bind(ranks)
        .bind(xp)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err("update ranks"))?;
        Ok(())
    }

    async fn rank(
        &mut self,
        cohort: &CohortKey,
        user: UserId,
    ) -> Result<Option<UserMapRank>, RunboardError> {
        sqlx::query(&format!(
            "SELECT * FROM user_map_ranks WHERE {COHORT_FILTER} AND user_id = $5"
        ))
        .bind(cohort.map_id.0)
        .bind(cohort.track_num as i16)
        .bind(cohort.zone_num as i16)
        .bind(cohort.flags.bits() as i32)
        .bind(user.0)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err("load rank"))?
        .as_ref()
        .map(rank_from_row)
        .transpose()
    }

    async fn record_completion(
        &mut self,
        track: TrackId,
        zone_num: u8,
        unique: bool,
    ) -> Result<TrackStats, RunboardError> {
        let row = sqlx::query(
            "INSERT INTO track_stats (track_id, zone_num, completions, unique_completions)
             VALUES ($1, $2, 1, $3)
             ON CONFLICT (track_id, zone_num) DO UPDATE SET
                 completions = track_stats.completions + 1,
                 unique_completions = track_stats.unique_completions + EXCLUDED.unique_completions
             RETURNING completions, unique_completions",
        )
        .bind(track.0)
        .bind(zone_num as i16)
        .bind(unique as i64)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err("record completion"))?;

        Ok(TrackStats {
            completions: unsigned(&row, "completions")?,
            unique_completions: unsigned(&row, "unique_completions")?,
        })
    }

    async fn track_stats(
        &mut self,
        track: TrackId,
        zone_num: u8,
    ) -> Result<TrackStats, RunboardError> {
        let row = sqlx::query(
            "SELECT completions, unique_completions FROM track_stats
             WHERE track_id = $1 AND zone_num = $2",
        )
        .bind(track.0)
        .bind(zone_num as i16)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err("load track stats"))?;

        match row {
            None => Ok(TrackStats::default()),
            Some(row) => Ok(TrackStats {
                completions: unsigned(&row, "completions")?,
                unique_completions: unsigned(&row, "unique_completions")?,
            }),
        }
    }

    async fn user_stats(&mut self, user: UserId) -> Result<UserStats, RunboardError> {
        let row = sqlx::query(
            "SELECT runs_submitted, maps_completed, cos_xp, level FROM user_stats
             WHERE user_id = $1",
        )
        .bind(user.0)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err("load user stats"))?;

        match row {
            None => Ok(UserStats::default()),
            Some(row) => {
                let level: i32 = column(&row, "level")?;
                Ok(UserStats {
                    runs_submitted: unsigned(&row, "runs_submitted")?,
                    maps_completed: unsigned(&row, "maps_completed")?,
                    cos_xp: unsigned(&row, "cos_xp")?,
                    level: level.max(1) as u32,
                })
            }
        }
    }

    async fn put_user_stats(
        &mut self,
        user: UserId,
        stats: &UserStats,
    ) -> Result<(), RunboardError> {
        sqlx::query(
            "INSERT INTO user_stats (user_id, runs_submitted, maps_completed, cos_xp, level)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (user_id) DO UPDATE SET
                 runs_submitted = EXCLUDED.runs_submitted,
                 maps_completed = EXCLUDED.maps_completed,
                 cos_xp = EXCLUDED.cos_xp,
                 level = EXCLUDED.level",
        )
        .bind(user.0)
        .bind(stats.runs_submitted as i64)
        .bind(stats.maps_completed as i64)
        .bind(stats.cos_xp as i64)
        .bind(stats.level as i32)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err("save user stats"))?;
        Ok(())
    }

    async fn insert_activity(
        &mut self,
        kind: ActivityType,
        user: UserId,
        data: i64,
    ) -> Result<Activity, RunboardError> {
        let row = sqlx::query(
            "INSERT INTO activities (type, user_id, data) VALUES ($1, $2, $3)
             RETURNING id, created_at",
        )
        .bind(kind.bits() as i32)
        .bind(user.0)
        .bind(data)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err("insert activity"))?;

        Ok(Activity {
            id: ActivityId(column(&row, "id")?),
            kind,
            user_id: user,
            data,
            created_at: column(&row, "created_at")?,
        })
    }

    async fn follower_subscribers(
        &mut self,
        followed: UserId,
    ) -> Result<Vec<Subscriber>, RunboardError> {
        let rows = sqlx::query(
            "SELECT follower_id AS user_id, notify_on FROM follows WHERE followed_id = $1",
        )
        .bind(followed.0)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err("load followers"))?;
        rows.iter().map(subscriber_from_row).collect()
    }

    async fn map_subscribers(&mut self, map: MapId) -> Result<Vec<Subscriber>, RunboardError> {
        let rows = sqlx::query("SELECT user_id, notify_on FROM map_notifies WHERE map_id = $1")
            .bind(map.0)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(db_err("load map subscribers"))?;
        rows.iter().map(subscriber_from_row).collect()
    }

    async fn insert_notifications(
        &mut self,
        activity: ActivityId,
        recipients: &[UserId],
    ) -> Result<u64, RunboardError> {
        if recipients.is_empty() {
            return Ok(0);
        }
        let users: Vec<i64> = recipients.iter().map(|u| u.0).collect();
        let result = sqlx::query(
            "INSERT INTO notifications (user_id, activity_id)
             SELECT DISTINCT u, $2 FROM UNNEST($1::BIGINT[]) AS u
             ON CONFLICT (user_id, activity_id) DO NOTHING",
        )
        .bind(users)
        .bind(activity.0)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err("insert notifications"))?;
        Ok(result.rows_affected())
    }

    async fn notifications(&mut self, user: UserId) -> Result<Vec<Notification>, RunboardError> {
        let rows = sqlx::query(
            "SELECT id, user_id, activity_id, read, created_at FROM notifications
             WHERE user_id = $1 ORDER BY id DESC",
        )
        .bind(user.0)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err("load notifications"))?;
        rows.iter().map(notification_from_row).collect()
    }

    async fn notification(
        &mut self,
        id: NotificationId,
    ) -> Result<Option<Notification>, RunboardError> {
        sqlx::query(
            "SELECT id, user_id, activity_id, read, created_at FROM notifications WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err("load notification"))?
        .as_ref()
        .map(notification_from_row)
        .transpose()
    }

    async fn set_notification_read(&mut self, id: NotificationId) -> Result<(), RunboardError> {
        sqlx::query("UPDATE notifications SET read = TRUE WHERE id = $1")
            .bind(id.0)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err("mark notification read"))?;
        Ok(())
    }

    async fn xp_config(&mut self) -> Result<Option<StoredXpConfig>, RunboardError> {
        let Some(row) = sqlx::query("SELECT version, config FROM xp_systems WHERE id = 1")
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err("load xp systems"))?
        else {
            return Ok(None);
        };

        let version = unsigned(&row, "version")?;
        let raw: serde_json::Value = column(&row, "config")?;
        let config = serde_json::from_value(raw).map_err(|e| {
            RunboardError::persistence(format!("stored xp systems config is malformed: {e}"), e)
        })?;
        Ok(Some(StoredXpConfig { version, config }))
    }

    async fn put_xp_config(&mut self, stored: &StoredXpConfig) -> Result<(), RunboardError> {
        let raw = serde_json::to_value(&stored.config).map_err(|e| {
            RunboardError::persistence(format!("failed to serialize xp systems config: {e}"), e)
        })?;
        sqlx::query(
            "INSERT INTO xp_systems (id, version, config) VALUES (1, $1, $2)
             ON CONFLICT (id) DO UPDATE SET version = EXCLUDED.version, config = EXCLUDED.config",
        )
        .bind(stored.version as i64)
        .bind(raw)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err("save xp systems"))?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), RunboardError> {
        self.tx.commit().await.map_err(db_err("commit"))
    }

    async fn rollback(self: Box<Self>) -> Result<(), RunboardError> {
        self.tx.rollback().await.map_err(db_err("rollback"))
    }
}
