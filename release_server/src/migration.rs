//! Schema migration for release tracking tables.

use diesel_async::AsyncPgConnection;
use diesel_async::SimpleAsyncConnection;

/// SQL migration for the release tracking tables.
///
/// Idempotent: every statement uses `IF NOT EXISTS`. Unique constraints back
/// the insert-or-ignore paths in the store.
pub const MIGRATION_SQL: &str = r#"
-- ================================================================
-- Releases
-- ================================================================

CREATE TABLE IF NOT EXISTS projects (
    id              BIGSERIAL PRIMARY KEY,
    organization_id BIGINT NOT NULL,
    slug            VARCHAR(255) NOT NULL,
    has_releases    BOOLEAN NOT NULL DEFAULT FALSE,
    UNIQUE (organization_id, slug)
);

CREATE TABLE IF NOT EXISTS releases (
    id              BIGSERIAL PRIMARY KEY,
    organization_id BIGINT NOT NULL,
    version         VARCHAR(250) NOT NULL,
    ref_name        VARCHAR(250),
    url             VARCHAR(512),
    owner_id        BIGINT,
    status          VARCHAR(16) DEFAULT 'open',
    date_added      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    date_started    TIMESTAMPTZ,
    date_released   TIMESTAMPTZ,
    data            JSONB NOT NULL DEFAULT '{}',
    new_groups      INTEGER NOT NULL DEFAULT 0,
    commit_count    INTEGER DEFAULT 0,
    last_commit_id  BIGINT,
    authors         TEXT[],
    total_deploys   INTEGER DEFAULT 0,
    last_deploy_id  BIGINT,
    package         TEXT,
    major           BIGINT,
    minor           BIGINT,
    patch           BIGINT,
    revision        BIGINT,
    prerelease      TEXT,
    build_code      TEXT,
    build_number    BIGINT,
    UNIQUE (organization_id, version)
);

CREATE INDEX IF NOT EXISTS idx_releases_semver
    ON releases (organization_id, major DESC, minor DESC, patch DESC, revision DESC);
CREATE INDEX IF NOT EXISTS idx_releases_build_code ON releases (organization_id, build_code);
CREATE INDEX IF NOT EXISTS idx_releases_build_number ON releases (organization_id, build_number);
CREATE INDEX IF NOT EXISTS idx_releases_date_added ON releases (organization_id, date_added);
CREATE INDEX IF NOT EXISTS idx_releases_status ON releases (organization_id, status);

CREATE TABLE IF NOT EXISTS release_projects (
    id              BIGSERIAL PRIMARY KEY,
    project_id      BIGINT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    release_id      BIGINT NOT NULL REFERENCES releases(id) ON DELETE CASCADE,
    new_groups      INTEGER DEFAULT 0,
    UNIQUE (project_id, release_id)
);

CREATE TABLE IF NOT EXISTS distributions (
    id              BIGSERIAL PRIMARY KEY,
    organization_id BIGINT NOT NULL,
    release_id      BIGINT NOT NULL REFERENCES releases(id) ON DELETE CASCADE,
    name            VARCHAR(64) NOT NULL,
    date_added      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (release_id, name)
);

CREATE TABLE IF NOT EXISTS release_environments (
    id              BIGSERIAL PRIMARY KEY,
    organization_id BIGINT NOT NULL,
    release_id      BIGINT NOT NULL REFERENCES releases(id) ON DELETE CASCADE,
    environment_id  BIGINT NOT NULL,
    UNIQUE (organization_id, release_id, environment_id)
);

CREATE TABLE IF NOT EXISTS release_project_environments (
    id              BIGSERIAL PRIMARY KEY,
    release_id      BIGINT NOT NULL REFERENCES releases(id) ON DELETE CASCADE,
    project_id      BIGINT NOT NULL,
    environment_id  BIGINT NOT NULL,
    UNIQUE (project_id, release_id, environment_id)
);

CREATE TABLE IF NOT EXISTS files (
    id              BIGSERIAL PRIMARY KEY,
    name            VARCHAR(255) NOT NULL,
    size            BIGINT,
    checksum        VARCHAR(64)
);

CREATE TABLE IF NOT EXISTS release_files (
    id              BIGSERIAL PRIMARY KEY,
    organization_id BIGINT NOT NULL,
    release_id      BIGINT NOT NULL REFERENCES releases(id) ON DELETE CASCADE,
    file_id         BIGINT NOT NULL REFERENCES files(id),
    name            VARCHAR(512) NOT NULL,
    UNIQUE (release_id, name)
);

-- ================================================================
-- Commits
-- ================================================================

CREATE TABLE IF NOT EXISTS repositories (
    id              BIGSERIAL PRIMARY KEY,
    organization_id BIGINT NOT NULL,
    name            VARCHAR(200) NOT NULL,
    date_added      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (organization_id, name)
);

CREATE TABLE IF NOT EXISTS commit_authors (
    id              BIGSERIAL PRIMARY KEY,
    organization_id BIGINT NOT NULL,
    name            VARCHAR(128),
    email           VARCHAR(75) NOT NULL,
    UNIQUE (organization_id, email)
);

CREATE TABLE IF NOT EXISTS commits (
    id              BIGSERIAL PRIMARY KEY,
    organization_id BIGINT NOT NULL,
    repository_id   BIGINT NOT NULL REFERENCES repositories(id),
    key             VARCHAR(64) NOT NULL,
    date_added      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    author_id       BIGINT REFERENCES commit_authors(id),
    message         TEXT,
    UNIQUE (repository_id, key)
);

CREATE INDEX IF NOT EXISTS idx_commits_org_key ON commits (organization_id, key);

CREATE TABLE IF NOT EXISTS commit_file_changes (
    id              BIGSERIAL PRIMARY KEY,
    organization_id BIGINT NOT NULL,
    commit_id       BIGINT NOT NULL REFERENCES commits(id) ON DELETE CASCADE,
    filename        TEXT NOT NULL,
    change_type     VARCHAR(1) NOT NULL,
    UNIQUE (commit_id, filename)
);

CREATE TABLE IF NOT EXISTS release_commits (
    id              BIGSERIAL PRIMARY KEY,
    organization_id BIGINT NOT NULL,
    release_id      BIGINT NOT NULL REFERENCES releases(id) ON DELETE CASCADE,
    commit_id       BIGINT NOT NULL REFERENCES commits(id) ON DELETE CASCADE,
    order_index     INTEGER NOT NULL,
    UNIQUE (release_id, commit_id),
    UNIQUE (release_id, order_index)
);

CREATE TABLE IF NOT EXISTS release_head_commits (
    id              BIGSERIAL PRIMARY KEY,
    organization_id BIGINT NOT NULL,
    repository_id   BIGINT NOT NULL REFERENCES repositories(id),
    release_id      BIGINT NOT NULL REFERENCES releases(id) ON DELETE CASCADE,
    commit_id       BIGINT NOT NULL REFERENCES commits(id),
    UNIQUE (repository_id, release_id)
);

CREATE TABLE IF NOT EXISTS pull_requests (
    id              BIGSERIAL PRIMARY KEY,
    organization_id BIGINT NOT NULL,
    repository_id   BIGINT NOT NULL REFERENCES repositories(id),
    key             VARCHAR(64) NOT NULL,
    title           TEXT,
    author_id       BIGINT REFERENCES commit_authors(id),
    merge_commit_sha VARCHAR(64),
    date_added      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (repository_id, key)
);

CREATE INDEX IF NOT EXISTS idx_pull_requests_merge_sha
    ON pull_requests (organization_id, merge_commit_sha);

-- ================================================================
-- Issues
-- ================================================================

CREATE TABLE IF NOT EXISTS issue_groups (
    id              BIGSERIAL PRIMARY KEY,
    project_id      BIGINT NOT NULL REFERENCES projects(id),
    status          VARCHAR(16) NOT NULL DEFAULT 'unresolved',
    first_release_id BIGINT REFERENCES releases(id) ON DELETE RESTRICT
);

CREATE INDEX IF NOT EXISTS idx_issue_groups_first_release ON issue_groups (first_release_id);

CREATE TABLE IF NOT EXISTS group_links (
    id              BIGSERIAL PRIMARY KEY,
    group_id        BIGINT NOT NULL REFERENCES issue_groups(id) ON DELETE CASCADE,
    project_id      BIGINT NOT NULL,
    linked_type     VARCHAR(16) NOT NULL,
    linked_id       BIGINT NOT NULL,
    relationship    VARCHAR(16) NOT NULL,
    date_added      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (group_id, linked_type, linked_id)
);

CREATE INDEX IF NOT EXISTS idx_group_links_linked ON group_links (linked_type, linked_id);

CREATE TABLE IF NOT EXISTS group_resolutions (
    id              BIGSERIAL PRIMARY KEY,
    group_id        BIGINT NOT NULL UNIQUE REFERENCES issue_groups(id) ON DELETE CASCADE,
    release_id      BIGINT NOT NULL REFERENCES releases(id) ON DELETE CASCADE,
    resolution_type VARCHAR(16) NOT NULL,
    status          VARCHAR(16) NOT NULL,
    actor_id        BIGINT,
    date_added      TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS group_inbox (
    id              BIGSERIAL PRIMARY KEY,
    group_id        BIGINT NOT NULL UNIQUE REFERENCES issue_groups(id) ON DELETE CASCADE,
    project_id      BIGINT NOT NULL,
    reason          VARCHAR(32) NOT NULL,
    date_added      TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS group_releases (
    id              BIGSERIAL PRIMARY KEY,
    project_id      BIGINT NOT NULL,
    group_id        BIGINT NOT NULL REFERENCES issue_groups(id) ON DELETE CASCADE,
    release_id      BIGINT NOT NULL REFERENCES releases(id) ON DELETE CASCADE,
    environment     VARCHAR(64) NOT NULL DEFAULT '',
    UNIQUE (group_id, release_id, environment)
);

-- ================================================================
-- Coordination
-- ================================================================

CREATE TABLE IF NOT EXISTS release_locks (
    lock_key        VARCHAR(255) PRIMARY KEY,
    holder_id       VARCHAR(64) NOT NULL,
    token           UUID NOT NULL,
    acquired_at     TIMESTAMPTZ NOT NULL,
    expires_at      TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS release_tasks (
    id              BIGSERIAL PRIMARY KEY,
    job_name        VARCHAR(64) NOT NULL,
    payload         JSONB NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_release_tasks_created ON release_tasks (created_at);
"#;

/// Run the release tracking migration.
pub async fn run_migration(conn: &mut AsyncPgConnection) -> anyhow::Result<()> {
    conn.batch_execute(MIGRATION_SQL)
        .await
        .map_err(|e| anyhow::anyhow!("release migration failed: {e}"))?;
    tracing::info!("Release migration applied");
    Ok(())
}
