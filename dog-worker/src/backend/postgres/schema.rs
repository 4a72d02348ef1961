/// Idempotent DDL for the ready set and the dead set.
pub const MIGRATIONS: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS jobs_queue (
        id              UUID PRIMARY KEY,
        type            TEXT        NOT NULL,
        run_at          TIMESTAMPTZ NOT NULL,
        payload         BYTEA       NOT NULL,
        created_at      TIMESTAMPTZ NOT NULL,
        updated_at      TIMESTAMPTZ NOT NULL,
        attempts_done   INTEGER     NOT NULL DEFAULT 0,
        last_attempt_at TIMESTAMPTZ,
        last_error      TEXT
    )"#,
    "CREATE INDEX IF NOT EXISTS jobs_queue_type_run_at_idx ON jobs_queue (type, run_at)",
    r#"CREATE TABLE IF NOT EXISTS dead_jobs (
        id              UUID PRIMARY KEY,
        type            TEXT        NOT NULL,
        payload         BYTEA       NOT NULL,
        created_at      TIMESTAMPTZ NOT NULL,
        updated_at      TIMESTAMPTZ NOT NULL,
        attempts_done   INTEGER     NOT NULL DEFAULT 0,
        last_attempt_at TIMESTAMPTZ,
        last_error      TEXT
    )"#,
];

pub const INSERT_JOBS_PREFIX: &str = "INSERT INTO jobs_queue \
    (id, type, run_at, payload, created_at, updated_at, attempts_done, last_attempt_at, last_error) ";

/// Claims the oldest ready row of the given types. Rows locked by another
/// transaction are skipped, not waited on.
pub const PICKUP_JOB: &str = "SELECT id, type, run_at, payload, created_at, updated_at, \
        attempts_done, last_attempt_at, last_error \
    FROM jobs_queue \
    WHERE type = ANY($1) AND run_at <= current_timestamp \
    ORDER BY id ASC \
    LIMIT 1 \
    FOR UPDATE SKIP LOCKED";

pub const DELETE_JOB: &str = "DELETE FROM jobs_queue WHERE id = $1";

pub const INSERT_DEAD_JOB: &str = "INSERT INTO dead_jobs \
    (id, type, payload, created_at, updated_at, attempts_done, last_attempt_at, last_error) \
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)";

pub const UPDATE_JOB_RETRY: &str = "UPDATE jobs_queue \
    SET run_at = $2, updated_at = $3, attempts_done = attempts_done + 1, \
        last_error = $4, last_attempt_at = $5 \
    WHERE id = $1";

pub const JOB_STATS: &str = "SELECT type, SUM(active)::BIGINT AS active, SUM(dead)::BIGINT AS dead \
    FROM ( \
        SELECT type, 1 AS active, 0 AS dead FROM jobs_queue \
        UNION ALL \
        SELECT type, 0 AS active, 1 AS dead FROM dead_jobs \
    ) AS counts \
    GROUP BY type \
    ORDER BY type ASC";

/// Dead rows have no run time; `updated_at` stands in for it.
pub const DEAD_JOBS_PAGE: &str = "SELECT id, type, updated_at AS run_at, payload, created_at, updated_at, \
        attempts_done, last_attempt_at, last_error \
    FROM dead_jobs \
    ORDER BY id ASC \
    LIMIT $1 OFFSET $2";

pub const RESURRECT_JOBS: &str = "WITH moved AS ( \
        DELETE FROM dead_jobs WHERE id = ANY($1) \
        RETURNING id, type, payload, created_at, attempts_done, last_attempt_at, last_error \
    ) \
    INSERT INTO jobs_queue \
        (id, type, run_at, payload, created_at, updated_at, attempts_done, last_attempt_at, last_error) \
    SELECT id, type, current_timestamp, payload, created_at, current_timestamp, \
        attempts_done, last_attempt_at, last_error \
    FROM moved";

pub const CLEAR_DEAD_JOBS: &str = "DELETE FROM dead_jobs WHERE id = ANY($1)";
