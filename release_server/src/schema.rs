//! Diesel table definitions for release tracking.
//!
//! Tables: releases, release_projects, projects, repositories, commit_authors,
//! commits, commit_file_changes, release_commits, release_head_commits,
//! pull_requests, issue_groups, group_links, group_resolutions, group_inbox,
//! group_releases, release_environments, release_project_environments,
//! files, release_files, distributions, release_locks, release_tasks.
//! Every organization-scoped table carries organization_id.

diesel::table! {
    releases (id) {
        id -> Int8,
        organization_id -> Int8,
        version -> Varchar,
        ref_name -> Nullable<Varchar>,
        url -> Nullable<Varchar>,
        owner_id -> Nullable<Int8>,
        status -> Nullable<Varchar>,
        date_added -> Timestamptz,
        date_started -> Nullable<Timestamptz>,
        date_released -> Nullable<Timestamptz>,
        data -> Jsonb,
        new_groups -> Int4,
        commit_count -> Nullable<Int4>,
        last_commit_id -> Nullable<Int8>,
        authors -> Nullable<Array<Text>>,
        total_deploys -> Nullable<Int4>,
        last_deploy_id -> Nullable<Int8>,
        package -> Nullable<Text>,
        major -> Nullable<Int8>,
        minor -> Nullable<Int8>,
        patch -> Nullable<Int8>,
        revision -> Nullable<Int8>,
        prerelease -> Nullable<Text>,
        build_code -> Nullable<Text>,
        build_number -> Nullable<Int8>,
    }
}

diesel::table! {
    projects (id) {
        id -> Int8,
        organization_id -> Int8,
        slug -> Varchar,
        has_releases -> Bool,
    }
}

diesel::table! {
    release_projects (id) {
        id -> Int8,
        project_id -> Int8,
        release_id -> Int8,
        new_groups -> Nullable<Int4>,
    }
}

diesel::table! {
    repositories (id) {
        id -> Int8,
        organization_id -> Int8,
        name -> Varchar,
        date_added -> Timestamptz,
    }
}

diesel::table! {
    commit_authors (id) {
        id -> Int8,
        organization_id -> Int8,
        name -> Nullable<Varchar>,
        email -> Varchar,
    }
}

diesel::table! {
    commits (id) {
        id -> Int8,
        organization_id -> Int8,
        repository_id -> Int8,
        key -> Varchar,
        date_added -> Timestamptz,
        author_id -> Nullable<Int8>,
        message -> Nullable<Text>,
    }
}

diesel::table! {
    commit_file_changes (id) {
        id -> Int8,
        organization_id -> Int8,
        commit_id -> Int8,
        filename -> Varchar,
        change_type -> Varchar,
    }
}

diesel::table! {
    release_commits (id) {
        id -> Int8,
        organization_id -> Int8,
        release_id -> Int8,
        commit_id -> Int8,
        order_index -> Int4,
    }
}

diesel::table! {
    release_head_commits (id) {
        id -> Int8,
        organization_id -> Int8,
        repository_id -> Int8,
        release_id -> Int8,
        commit_id -> Int8,
    }
}

diesel::table! {
    pull_requests (id) {
        id -> Int8,
        organization_id -> Int8,
        repository_id -> Int8,
        key -> Varchar,
        title -> Nullable<Text>,
        author_id -> Nullable<Int8>,
        merge_commit_sha -> Nullable<Varchar>,
        date_added -> Timestamptz,
    }
}

diesel::table! {
    issue_groups (id) {
        id -> Int8,
        project_id -> Int8,
        status -> Varchar,
        first_release_id -> Nullable<Int8>,
    }
}

diesel::table! {
    group_links (id) {
        id -> Int8,
        group_id -> Int8,
        project_id -> Int8,
        linked_type -> Varchar,
        linked_id -> Int8,
        relationship -> Varchar,
        date_added -> Timestamptz,
    }
}

diesel::table! {
    group_resolutions (id) {
        id -> Int8,
        group_id -> Int8,
        release_id -> Int8,
        resolution_type -> Varchar,
        status -> Varchar,
        actor_id -> Nullable<Int8>,
        date_added -> Timestamptz,
    }
}

diesel::table! {
    group_inbox (id) {
        id -> Int8,
        group_id -> Int8,
        project_id -> Int8,
        reason -> Varchar,
        date_added -> Timestamptz,
    }
}

diesel::table! {
    group_releases (id) {
        id -> Int8,
        project_id -> Int8,
        group_id -> Int8,
        release_id -> Int8,
        environment -> Varchar,
    }
}

diesel::table! {
    release_environments (id) {
        id -> Int8,
        organization_id -> Int8,
        release_id -> Int8,
        environment_id -> Int8,
    }
}

diesel::table! {
    release_project_environments (id) {
        id -> Int8,
        release_id -> Int8,
        project_id -> Int8,
        environment_id -> Int8,
    }
}

diesel::table! {
    files (id) {
        id -> Int8,
        name -> Varchar,
        size -> Nullable<Int8>,
        checksum -> Nullable<Varchar>,
    }
}

diesel::table! {
    release_files (id) {
        id -> Int8,
        organization_id -> Int8,
        release_id -> Int8,
        file_id -> Int8,
        name -> Varchar,
    }
}

diesel::table! {
    distributions (id) {
        id -> Int8,
        organization_id -> Int8,
        release_id -> Int8,
        name -> Varchar,
        date_added -> Timestamptz,
    }
}

diesel::table! {
    release_locks (lock_key) {
        lock_key -> Varchar,
        holder_id -> Varchar,
        token -> Uuid,
        acquired_at -> Timestamptz,
        expires_at -> Timestamptz,
    }
}

diesel::table! {
    release_tasks (id) {
        id -> Int8,
        job_name -> Varchar,
        payload -> Jsonb,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(release_commits -> commits (commit_id));
diesel::joinable!(release_projects -> releases (release_id));

diesel::allow_tables_to_appear_in_same_query!(
    releases,
    release_projects,
    release_commits,
    commits,
);
