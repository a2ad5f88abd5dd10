mod support;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Result;
use feedscan_core::ScanError;
use feedscan_core::config::{PipelineConfig, StorageConfig};
use feedscan_core::queue::Envelope;
use feedscan_core::runtime::Pipeline;
use feedscan_core::scan::{
    DriverRegistry, LatestItemResolver, StartOutcome, StartScanRequest, WarmPagesDriver,
};
use feedscan_model::{
    IndexScan, IndexScanMessage, LeafId, LeafScanMessage, PageId, PageScan, PageScanMessage,
    PageScanState, ScanId, ScanState, ScanType,
};
use support::{at, harness, harness_with, leaf, page_url, three_page_feed};

fn started(outcome: StartOutcome) -> IndexScan {
    match outcome {
        StartOutcome::Started(scan) => scan,
        other => panic!("expected a started scan, got {other:?}"),
    }
}

fn resolver(h: &support::Harness, table: &str) -> LatestItemResolver {
    LatestItemResolver::new(Arc::new(h.store.clone()), table, &StorageConfig::default())
}

#[tokio::test(start_paused = true)]
async fn latest_leaves_scan_runs_to_completion() -> Result<()> {
    let h = harness(three_page_feed());
    let service = h.pipeline.service();

    let scan = started(service.start(StartScanRequest::ad_hoc(ScanType::LatestLeaves)).await?);
    assert_eq!(scan.max, Some(at(3, 4)));
    h.drain().await;

    let status = service.status("", &scan.scan_id).await?.expect("scan exists");
    assert_eq!(status.scan.state, ScanState::Complete);
    assert!(!status.running);
    assert_eq!((status.pending_pages, status.pending_leaves), (0, 0));
    assert!(status.scan.completed_at.is_some());

    let latest = resolver(&h, "latest_leaves");
    let a = latest.get("a", "1.0.0").await?.expect("a");
    assert_eq!(a.commit_timestamp, at(3, 2));
    let b = latest.get("b", "1.0.0").await?.expect("b");
    assert_eq!(b.commit_timestamp, at(2, 4));
    for id in ["c", "d", "e", "f", "g", "h"] {
        assert!(latest.get(id, "1.0.0").await?.is_some(), "{id}");
    }
    assert!(latest.get("b", "2.0.0").await?.is_some());

    assert_eq!(h.feed.page_fetches.load(Ordering::SeqCst), 3);
    assert_eq!(h.feed.leaf_fetch_total(), 0);
    assert_eq!(h.poison_depth().await, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn page_rows_match_the_bounds_exactly() -> Result<()> {
    let cases = [
        // A page whose timestamp equals min is already covered.
        ((1, 4), (2, 2), vec![1]),
        ((1, 3), (3, 1), vec![0, 1, 2]),
        ((2, 4), (3, 4), vec![2]),
        ((1, 0), (1, 1), vec![0]),
    ];
    for ((min_day, min_hour), (max_day, max_hour), pages) in cases {
        let h = harness(three_page_feed());
        let scan = started(
            h.pipeline
                .service()
                .start(StartScanRequest {
                    min: Some(at(min_day, min_hour)),
                    max: Some(at(max_day, max_hour)),
                    ..StartScanRequest::ad_hoc(ScanType::LatestLeaves)
                })
                .await?,
        );

        // The first batch is just the index message, which expands the scan
        // and then polls.
        assert_eq!(h.pipeline.process_batch().await?, 1);

        let scan = h.pipeline.service().get_scan("", &scan.scan_id).await?.expect("scan");
        assert_eq!(scan.state, ScanState::Enqueued);
        let urls: BTreeSet<String> = h
            .pipeline
            .storage()
            .list_page_scans(&scan.scan_id)
            .await?
            .into_iter()
            .map(|p| p.url)
            .collect();
        let expected: BTreeSet<String> = pages.into_iter().map(page_url).collect();
        assert_eq!(urls, expected);
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn scoping_clamps_max_to_the_feed() -> Result<()> {
    let h = harness(three_page_feed());
    let scan = started(
        h.pipeline
            .service()
            .start(StartScanRequest {
                max: Some(at(20, 0)),
                ..StartScanRequest::ad_hoc(ScanType::LatestLeaves)
            })
            .await?,
    );
    h.drain().await;

    let scan = h.pipeline.service().get_scan("", &scan.scan_id).await?.expect("scan");
    let (min, max) = scan.bounds().expect("bounds");
    assert!(min < max);
    assert_eq!(max, at(3, 4));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn leaf_details_fans_out_one_leaf_per_item() -> Result<()> {
    let h = harness(three_page_feed());
    let scan = started(
        h.pipeline
            .service()
            .start(StartScanRequest::ad_hoc(ScanType::LeafDetails))
            .await?,
    );
    h.drain().await;

    assert!(!h.pipeline.service().is_running("", &scan.scan_id).await?);
    // Page 1 carries b 1.0.0 twice; only its newest leaf is fetched.
    assert_eq!(h.feed.leaf_fetch_total(), 11);
    assert!(h.feed.leaf_fetches.lock().unwrap().values().all(|n| *n == 1));

    let details = resolver(&h, "leaf_details");
    let b = details.get("b", "1.0.0").await?.expect("b");
    assert_eq!(b.commit_timestamp, at(2, 4));
    assert_eq!(b.payload["leafType"], "Details");
    let a = details.get("a", "1.0.0").await?.expect("a");
    assert_eq!(a.commit_timestamp, at(3, 2));

    let storage = h.pipeline.storage();
    assert_eq!(storage.child_count_lower_bound(&scan.scan_id).await?, 0);
    assert_eq!(h.poison_depth().await, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn redelivered_messages_are_noops() -> Result<()> {
    let h = harness(three_page_feed());
    let scan = started(
        h.pipeline
            .service()
            .start(StartScanRequest::ad_hoc(ScanType::LeafDetails))
            .await?,
    );
    h.drain().await;
    let leaf_fetches = h.feed.leaf_fetch_total();
    let page_fetches = h.feed.page_fetches.load(Ordering::SeqCst);

    let enqueuer = h.pipeline.enqueuer();
    enqueuer
        .enqueue(&[PageScanMessage {
            scan_id: scan.scan_id.clone(),
            page_id: PageId::from_rank(0),
        }])
        .await?;
    enqueuer
        .enqueue(&[LeafScanMessage {
            scan_id: scan.scan_id.clone(),
            page_id: PageId::from_rank(0),
            leaf_id: LeafId::from_rank(0),
        }])
        .await?;
    enqueuer
        .enqueue(&[IndexScanMessage {
            cursor_name: String::new(),
            scan_id: scan.scan_id.clone(),
        }])
        .await?;
    assert_eq!(h.drain().await, 3);

    assert_eq!(h.feed.leaf_fetch_total(), leaf_fetches);
    assert_eq!(h.feed.page_fetches.load(Ordering::SeqCst), page_fetches);
    assert_eq!(h.poison_depth().await, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn bulk_and_individual_enqueue_process_the_same_work() -> Result<()> {
    let mut outcomes = Vec::new();
    for threshold in [1, 0] {
        let mut config = PipelineConfig::default();
        config.queue.bulk_enqueue_threshold = threshold;
        // Small bodies force several bulk envelopes per page.
        config.queue.max_message_size = 512;
        let h = harness_with(three_page_feed(), config);

        started(
            h.pipeline
                .service()
                .start(StartScanRequest::ad_hoc(ScanType::LeafDetails))
                .await?,
        );
        h.drain().await;

        let fetched: BTreeSet<String> =
            h.feed.leaf_fetches.lock().unwrap().keys().cloned().collect();
        let details = resolver(&h, "leaf_details");
        let mut latest = Vec::new();
        for (id, version) in [("a", "1.0.0"), ("b", "1.0.0"), ("b", "2.0.0"), ("h", "1.0.0")] {
            latest.push(details.get(id, version).await?.map(|r| r.commit_timestamp));
        }
        assert_eq!(h.poison_depth().await, 0);
        outcomes.push((fetched, latest));
    }
    assert_eq!(outcomes[0], outcomes[1]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn cursor_scans_resume_from_the_cursor() -> Result<()> {
    let h = harness(three_page_feed());
    let service = h.pipeline.service();
    let request = StartScanRequest::with_default_cursor(ScanType::LatestLeaves);
    let cursor = ScanType::LatestLeaves.default_cursor_name();

    let first = started(service.start(request.clone()).await?);
    match service.start(request.clone()).await? {
        StartOutcome::AlreadyRunning(running) => assert_eq!(running.scan_id, first.scan_id),
        other => panic!("expected the running scan, got {other:?}"),
    }

    h.drain().await;
    let moved = service.advance_cursor(&cursor, &first.scan_id).await?;
    assert_eq!(moved.value, at(3, 4));
    assert!(matches!(
        service.start(request.clone()).await?,
        StartOutcome::UpToDate { .. }
    ));

    h.feed.push_page(vec![
        leaf("A", "1.0.0", at(4, 1)),
        leaf("Z", "1.0.0", at(4, 2)),
    ]);
    let second = started(service.start(request).await?);
    assert_eq!(second.bounds(), Some((at(3, 4), at(4, 2))));
    h.drain().await;

    let latest = resolver(&h, "latest_leaves");
    assert_eq!(latest.get("a", "1.0.0").await?.expect("a").commit_timestamp, at(4, 1));
    assert!(latest.get("z", "1.0.0").await?.is_some());

    let scans = service.latest_scans(&cursor, 10).await?;
    let ids: Vec<ScanId> = scans.into_iter().map(|s| s.scan_id).collect();
    assert_eq!(ids, vec![second.scan_id, first.scan_id]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn cursorless_scan_types_reject_cursors() {
    let h = harness(three_page_feed());
    let err = h
        .pipeline
        .service()
        .start(StartScanRequest {
            cursor_name: Some("warm".into()),
            ..StartScanRequest::ad_hoc(ScanType::WarmPages)
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::InvalidRequest(_)));
}

#[tokio::test(start_paused = true)]
async fn requeue_resends_pending_work() -> Result<()> {
    let h = harness(three_page_feed());
    let service = h.pipeline.service();
    let scan = started(service.start(StartScanRequest::ad_hoc(ScanType::LeafDetails)).await?);
    h.pipeline.process_batch().await?;

    let summary = service.requeue("", &scan.scan_id).await?;
    assert_eq!(summary.pages, 3);
    assert_eq!(summary.leaves, 0);
    assert!(summary.index);

    h.drain().await;
    assert!(!service.is_running("", &scan.scan_id).await?);
    assert!(h.feed.leaf_fetches.lock().unwrap().values().all(|n| *n == 1));
    assert_eq!(
        service.requeue("", &scan.scan_id).await?,
        Default::default()
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn interrupted_expansion_inserts_only_missing_pages() -> Result<()> {
    let h = harness(three_page_feed());
    let storage = h.pipeline.storage();

    let mut scan = IndexScan::new(
        ScanId::new(),
        "",
        ScanType::LatestLeaves,
        Some(at(1, 3)),
        Some(at(3, 1)),
    );
    scan.state = ScanState::Scoped;
    storage.insert_index_scan(&scan).await?;
    storage
        .insert_page_scans(&[PageScan {
            scan_id: scan.scan_id.clone(),
            page_id: PageId::from_rank(1),
            scan_type: scan.scan_type,
            state: PageScanState::Created,
            min: at(1, 3),
            max: at(3, 1),
            url: page_url(1),
            commit_timestamp: at(2, 4),
        }])
        .await?;

    let message = IndexScanMessage {
        cursor_name: String::new(),
        scan_id: scan.scan_id.clone(),
    };
    h.pipeline.dispatcher().handle(Envelope::wrap(&message)?).await?;

    let pages: Vec<PageId> = storage
        .list_page_scans(&scan.scan_id)
        .await?
        .into_iter()
        .map(|p| p.page_id)
        .collect();
    assert_eq!(pages, (0..3).map(PageId::from_rank).collect::<Vec<_>>());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn foreign_page_rows_fail_expansion() -> Result<()> {
    let h = harness(three_page_feed());
    let storage = h.pipeline.storage();

    let mut scan = IndexScan::new(
        ScanId::new(),
        "",
        ScanType::LatestLeaves,
        Some(at(1, 3)),
        Some(at(2, 2)),
    );
    scan.state = ScanState::Scoped;
    storage.insert_index_scan(&scan).await?;
    storage
        .insert_page_scans(&[PageScan {
            scan_id: scan.scan_id.clone(),
            page_id: PageId::from_rank(2),
            scan_type: scan.scan_type,
            state: PageScanState::Created,
            min: at(1, 3),
            max: at(2, 2),
            url: page_url(2),
            commit_timestamp: at(3, 4),
        }])
        .await?;

    let message = IndexScanMessage {
        cursor_name: String::new(),
        scan_id: scan.scan_id.clone(),
    };
    let err = h
        .pipeline
        .dispatcher()
        .handle(Envelope::wrap(&message)?)
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::InvariantViolation(_)));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn missing_driver_ends_in_poison_queue() -> Result<()> {
    let mut config = PipelineConfig::default();
    config.queue.max_dequeue_count = 3;
    let feed = Arc::new(three_page_feed());
    let store = feedscan_core::store::InMemoryTableStore::default();
    let queue = feedscan_core::queue::InMemoryQueue::new(65_536, 3);
    let pipeline = Pipeline::with_drivers(
        config,
        Arc::new(store.clone()),
        Arc::new(queue.clone()),
        feed.clone(),
        DriverRegistry::new().with(WarmPagesDriver),
    );
    let h = support::Harness {
        store,
        queue,
        feed,
        pipeline,
    };

    let scan = started(
        h.pipeline
            .service()
            .start(StartScanRequest::ad_hoc(ScanType::LeafDetails))
            .await?,
    );
    h.drain().await;

    assert_eq!(h.poison_depth().await, 1);
    let scan = h.pipeline.service().get_scan("", &scan.scan_id).await?.expect("scan");
    assert_eq!(scan.state, ScanState::Created);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn warm_pages_fetches_each_page_once() -> Result<()> {
    let h = harness(three_page_feed());
    let scan = started(
        h.pipeline
            .service()
            .start(StartScanRequest::ad_hoc(ScanType::WarmPages))
            .await?,
    );
    h.drain().await;

    assert!(!h.pipeline.service().is_running("", &scan.scan_id).await?);
    assert_eq!(h.feed.page_fetches.load(Ordering::SeqCst), 3);
    assert_eq!(h.feed.leaf_fetch_total(), 0);
    Ok(())
}
