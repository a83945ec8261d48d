mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use common::{authored, commit, patch, Harness, ORG};
use releasetrack_server::lock::LockManager;
use releasetrack_server::models::commit::{default_repository_name, CommitRef, CommitSubmission};
use releasetrack_server::queue::ScheduledTask;
use releasetrack_server::ReleaseError;

fn keys(h: &Harness, release_id: i64) -> Vec<String> {
    h.store.release_commit_keys(release_id)
}

#[tokio::test]
async fn binds_newest_first_keeping_submission_order_on_ties() {
    let h = Harness::new();
    let project = h.project("web");
    let release = h.release(&project, "1.0.0").await.unwrap();

    let outcome = h
        .services
        .commits
        .set_commits(
            &release,
            vec![
                commit("a", "acme/web", Some(10)),
                commit("b", "acme/web", Some(30)),
                commit("c", "acme/web", None),
                commit("d", "acme/web", Some(30)),
            ],
        )
        .await
        .unwrap();

    assert_eq!(keys(&h, release.id), ["b", "d", "a", "c"]);
    let orders: Vec<i32> = h
        .store
        .release_commit_rows(release.id)
        .iter()
        .map(|row| row.order_index)
        .collect();
    assert_eq!(orders, [0, 1, 2, 3]);

    assert_eq!(outcome.release.commit_count, Some(4));
    let newest = h.store.commit_by_key(ORG, "b").unwrap();
    assert_eq!(outcome.release.last_commit_id, Some(newest.id));
}

#[tokio::test]
async fn second_binding_replaces_the_first() {
    let h = Harness::new();
    let project = h.project("web");
    let release = h.release(&project, "1.0.0").await.unwrap();

    h.services
        .commits
        .set_commits(
            &release,
            vec![commit("a", "acme/web", Some(10)), commit("b", "acme/web", Some(20))],
        )
        .await
        .unwrap();
    let outcome = h
        .services
        .commits
        .set_commits(&release, vec![commit("c", "acme/web", Some(30))])
        .await
        .unwrap();

    assert_eq!(keys(&h, release.id), ["c"]);
    assert_eq!(outcome.release.commit_count, Some(1));
    // Commits from the first binding survive; only the binding rows go.
    assert!(h.store.commit_by_key(ORG, "a").is_some());
}

#[tokio::test]
async fn empty_list_clears_bindings_and_stats() {
    let h = Harness::new();
    let project = h.project("web");
    let release = h.release(&project, "1.0.0").await.unwrap();

    h.services
        .commits
        .set_commits(
            &release,
            vec![authored(commit("a", "acme/web", Some(10)), Some("Jane"), None)],
        )
        .await
        .unwrap();
    let outcome = h.services.commits.set_commits(&release, vec![]).await.unwrap();

    assert!(h.store.release_commit_rows(release.id).is_empty());
    assert_eq!(outcome.release.commit_count, Some(0));
    assert_eq!(outcome.release.last_commit_id, None);
    assert_eq!(outcome.release.authors, Some(vec![]));
}

#[tokio::test]
async fn authors_are_synthesized_and_deduplicated() {
    let h = Harness::new();
    let project = h.project("web");
    let release = h.release(&project, "1.0.0").await.unwrap();

    let outcome = h
        .services
        .commits
        .set_commits(
            &release,
            vec![
                authored(commit("a", "acme/web", Some(30)), Some("A. Test!"), None),
                authored(commit("b", "acme/web", Some(20)), Some("Someone"), Some("x@y.com")),
                authored(commit("c", "acme/web", Some(10)), Some("A. Test!"), None),
                commit("d", "acme/web", Some(5)),
            ],
        )
        .await
        .unwrap();

    let mut emails: Vec<String> = h.store.commit_authors(ORG).into_iter().map(|a| a.email).collect();
    emails.sort();
    assert_eq!(emails, ["atest@localhost", "x@y.com"]);

    let authors = outcome.release.authors.unwrap_or_default();
    assert_eq!(authors.len(), 2);
    let first = h.store.commit_by_key(ORG, "a").and_then(|c| c.author_id).unwrap();
    assert_eq!(authors[0], first.to_string());
    assert_eq!(h.store.commit_by_key(ORG, "c").and_then(|c| c.author_id), Some(first));
    assert_eq!(h.store.commit_by_key(ORG, "d").and_then(|c| c.author_id), None);
}

#[tokio::test]
async fn known_author_is_renamed() {
    let h = Harness::new();
    let project = h.project("web");
    let release = h.release(&project, "1.0.0").await.unwrap();
    let author = h.store.add_commit_author(ORG, Some("Old Name"), "dev@acme.io");

    h.services
        .commits
        .set_commits(
            &release,
            vec![authored(commit("a", "acme/web", Some(1)), Some("New Name"), Some("dev@acme.io"))],
        )
        .await
        .unwrap();

    let authors = h.store.commit_authors(ORG);
    assert_eq!(authors.len(), 1);
    assert_eq!(authors[0].id, author.id);
    assert_eq!(authors[0].name.as_deref(), Some("New Name"));
}

#[tokio::test]
async fn existing_commit_is_patched_with_provided_fields_only() {
    let h = Harness::new();
    let project = h.project("web");
    let release = h.release(&project, "1.0.0").await.unwrap();

    let mut first = authored(commit("a", "acme/web", Some(100)), Some("Jane"), None);
    first.message = Some("wip".to_string());
    h.services.commits.set_commits(&release, vec![first]).await.unwrap();
    let before = h.store.commit_by_key(ORG, "a").unwrap();

    let mut second = commit("a", "acme/web", None);
    second.message = Some("fix login redirect".to_string());
    h.services.commits.set_commits(&release, vec![second]).await.unwrap();

    let after = h.store.commit_by_key(ORG, "a").unwrap();
    assert_eq!(after.id, before.id);
    assert_eq!(after.message.as_deref(), Some("fix login redirect"));
    assert_eq!(after.author_id, before.author_id);
    assert_eq!(after.date_added, before.date_added);
}

#[tokio::test]
async fn invalid_patch_entries_are_skipped() {
    let h = Harness::new();
    let project = h.project("web");
    let release = h.release(&project, "1.0.0").await.unwrap();

    let mut submission = commit("a", "acme/web", Some(1));
    submission.patch_set = vec![
        patch(Some("src/app.rs"), Some("M")),
        patch(None, Some("A")),
        patch(Some("README.md"), Some("R")),
        patch(Some("docs/intro.md"), Some("A")),
    ];
    h.services.commits.set_commits(&release, vec![submission]).await.unwrap();

    let commit = h.store.commit_by_key(ORG, "a").unwrap();
    let mut files: Vec<(String, String)> = h
        .store
        .file_changes(commit.id)
        .into_iter()
        .map(|fc| (fc.filename, fc.change_type))
        .collect();
    files.sort();
    assert_eq!(
        files,
        [
            ("docs/intro.md".to_string(), "A".to_string()),
            ("src/app.rs".to_string(), "M".to_string())
        ]
    );
}

#[tokio::test]
async fn commits_without_repository_land_in_the_organization_repository() {
    let h = Harness::new();
    let project = h.project("web");
    let release = h.release(&project, "1.0.0").await.unwrap();

    let mut submission = commit("a", "unused", Some(1));
    submission.repository = None;
    h.services.commits.set_commits(&release, vec![submission]).await.unwrap();

    let names: Vec<String> = h.store.repositories(ORG).into_iter().map(|r| r.name).collect();
    assert_eq!(names, [default_repository_name(ORG)]);
}

#[tokio::test]
async fn head_commit_is_first_commit_per_repository() {
    let h = Harness::new();
    let project = h.project("web");
    let release = h.release(&project, "1.0.0").await.unwrap();

    let outcome = h
        .services
        .commits
        .set_commits(
            &release,
            vec![
                commit("a", "acme/web", Some(10)),
                commit("b", "acme/api", Some(20)),
                commit("c", "acme/web", Some(30)),
            ],
        )
        .await
        .unwrap();
    assert_eq!(outcome.head_commits.len(), 2);

    let web = h.store.repositories(ORG).into_iter().find(|r| r.name == "acme/web").unwrap();
    let head = h
        .store
        .head_commits(release.id)
        .into_iter()
        .find(|head| head.repository_id == web.id)
        .unwrap();
    assert_eq!(head.commit_id, h.store.commit_by_key(ORG, "c").unwrap().id);
}

#[tokio::test]
async fn set_commits_never_overwrites_a_head_commit_but_set_refs_does() {
    let h = Harness::new();
    let project = h.project("web");
    let release = h.release(&project, "1.0.0").await.unwrap();
    let repo = h.store.add_repository(ORG, "acme/web");

    h.services
        .commits
        .set_refs(
            &release,
            vec![CommitRef {
                repository: "acme/web".into(),
                commit: "pinned".into(),
                previous_commit: None,
            }],
            None,
            false,
        )
        .await
        .unwrap();
    let pinned = h.store.commit_by_key(ORG, "pinned").unwrap();

    h.services
        .commits
        .set_commits(&release, vec![commit("a", "acme/web", Some(10))])
        .await
        .unwrap();
    let heads = h.store.head_commits(release.id);
    assert_eq!(heads.len(), 1);
    assert_eq!(heads[0].repository_id, repo.id);
    assert_eq!(heads[0].commit_id, pinned.id);

    h.services
        .commits
        .set_refs(
            &release,
            vec![CommitRef {
                repository: "acme/web".into(),
                commit: "pinned..a".into(),
                previous_commit: None,
            }],
            None,
            false,
        )
        .await
        .unwrap();
    let heads = h.store.head_commits(release.id);
    assert_eq!(heads.len(), 1);
    assert_eq!(heads[0].commit_id, h.store.commit_by_key(ORG, "a").unwrap().id);
}

#[tokio::test]
async fn set_refs_rejects_unknown_repositories_without_writing() {
    let h = Harness::new();
    let project = h.project("web");
    let release = h.release(&project, "1.0.0").await.unwrap();
    h.store.add_repository(ORG, "acme/web");

    let refs = ["zeta/svc", "acme/web", "alpha/svc"]
        .into_iter()
        .map(|name| CommitRef {
            repository: name.into(),
            commit: "abc".into(),
            previous_commit: None,
        })
        .collect();
    let err = h
        .services
        .commits
        .set_refs(&release, refs, None, true)
        .await
        .unwrap_err();

    match err {
        ReleaseError::InvalidRepository { names } => assert_eq!(names, ["alpha/svc", "zeta/svc"]),
        other => panic!("unexpected error: {other}"),
    }
    assert!(h.store.head_commits(release.id).is_empty());
    assert!(h.store.commit_by_key(ORG, "abc").is_none());
    assert!(h.queue.tasks().is_empty());
}

#[tokio::test]
async fn set_refs_with_fetch_schedules_commit_fetch() {
    let h = Harness::new();
    let project = h.project("web");
    let previous = h.release(&project, "0.9.0").await.unwrap();
    let release = h.release(&project, "1.0.0").await.unwrap();
    h.store.add_repository(ORG, "acme/web");

    h.services
        .commits
        .set_refs(
            &release,
            vec![CommitRef {
                repository: "acme/web".into(),
                commit: "old..new".into(),
                previous_commit: None,
            }],
            Some(42),
            true,
        )
        .await
        .unwrap();

    assert_eq!(
        h.queue.tasks(),
        [ScheduledTask::FetchCommits {
            release_id: release.id,
            user_id: Some(42),
            refs: vec![CommitRef {
                repository: "acme/web".into(),
                commit: "new".into(),
                previous_commit: Some("old".into()),
            }],
            prev_release_id: Some(previous.id),
        }]
    );
}

#[tokio::test]
async fn marked_commits_are_ignored() {
    let h = Harness::new();
    let project = h.project("web");
    let release = h.release(&project, "1.0.0").await.unwrap();

    let mut skipped = commit("a", "acme/web", Some(20));
    skipped.message = Some("bump deps #skiprelease".to_string());
    let outcome = h
        .services
        .commits
        .set_commits(&release, vec![skipped, commit("b", "acme/web", Some(10))])
        .await
        .unwrap();

    assert_eq!(keys(&h, release.id), ["b"]);
    assert_eq!(outcome.release.commit_count, Some(1));
    assert!(h.store.commit_by_key(ORG, "a").is_none());
}

#[tokio::test]
async fn concurrent_binding_is_rejected_while_the_lock_is_held() {
    let h = Harness::new();
    let project = h.project("web");
    let release = h.release(&project, "1.0.0").await.unwrap();

    let lease = h
        .locks
        .try_acquire(&release.lock_key(), Duration::from_secs(10))
        .await
        .unwrap()
        .unwrap();

    let err = h
        .services
        .commits
        .set_commits(&release, vec![commit("a", "acme/web", Some(1))])
        .await
        .unwrap_err();
    assert!(matches!(err, ReleaseError::LockBusy { .. }), "got {err}");
    assert!(h.store.release_commit_rows(release.id).is_empty());

    assert!(h.locks.release(&lease).await.unwrap());
    h.services
        .commits
        .set_commits(&release, vec![commit("a", "acme/web", Some(1))])
        .await
        .unwrap();
    assert_eq!(keys(&h, release.id), ["a"]);
    assert!(!h.locks.is_locked(&release.lock_key()).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_binding_is_rejected_while_the_first_holds_the_lock() {
    let h = Arc::new(Harness::new());
    let project = h.project("web");
    let release = h.release(&project, "1.0.0").await.unwrap();
    h.gate.arm();

    let first = {
        let h = h.clone();
        let release = release.clone();
        tokio::spawn(async move {
            h.services
                .commits
                .set_commits(
                    &release,
                    vec![commit("a1", "acme/web", Some(2)), commit("a2", "acme/web", Some(1))],
                )
                .await
        })
    };
    h.gate.entered.notified().await;

    let err = h
        .services
        .commits
        .set_commits(&release, vec![commit("b1", "acme/web", Some(3))])
        .await
        .unwrap_err();
    assert!(matches!(err, ReleaseError::LockBusy { .. }), "got {err}");

    h.gate.resume.notify_one();
    first.await.unwrap().unwrap();

    assert_eq!(keys(&h, release.id), ["a1", "a2"]);
    assert!(!h.locks.is_locked(&release.lock_key()).await.unwrap());
}

#[tokio::test]
async fn sub_second_timestamps_decide_the_order() {
    let h = Harness::new();
    let project = h.project("web");
    let release = h.release(&project, "1.0.0").await.unwrap();
    let at = |key: &str, millis: i64| CommitSubmission {
        timestamp: Utc.timestamp_millis_opt(millis).single(),
        ..commit(key, "acme/web", None)
    };

    let outcome = h
        .services
        .commits
        .set_commits(&release, vec![at("old", 1_000_100), at("new", 1_000_900)])
        .await
        .unwrap();

    assert_eq!(keys(&h, release.id), ["new", "old"]);
    let new_id = outcome.bound.iter().find(|b| b.key == "new").unwrap().commit_id;
    assert_eq!(outcome.release.last_commit_id, Some(new_id));
}

#[tokio::test]
async fn loosely_formed_patch_sets_are_accepted() {
    let h = Harness::new();
    let project = h.project("web");
    let release = h.release(&project, "1.0.0").await.unwrap();
    let commits: Vec<CommitSubmission> = serde_json::from_str(
        r#"[
            {"id": "a", "repository": "acme/web", "patch_set": null},
            {"id": "b", "repository": "acme/web", "patch_set": [
                {"path": "src/lib.rs", "type": "M"},
                {"path": 42, "type": "A"}
            ]}
        ]"#,
    )
    .unwrap();

    h.services.commits.set_commits(&release, commits).await.unwrap();

    let mut bound = keys(&h, release.id);
    bound.sort();
    assert_eq!(bound, ["a", "b"]);
    let b = h.store.commit_by_key(ORG, "b").unwrap();
    let changes = h.store.file_changes(b.id);
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].filename, "src/lib.rs");
}
