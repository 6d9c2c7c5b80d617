//! End-to-end behavior over in-process replicas: shell-level results,
//! partitions, and convergence through the reconciler.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use paxos_dictionary::client::{ShellReply, handle_line, warm_up};
use paxos_dictionary::cluster::{Cluster, Connector};
use paxos_dictionary::learner::Learner;
use paxos_dictionary::local::LocalNetwork;
use paxos_dictionary::proposer::{Coordinator, Outcome};
use paxos_dictionary::reconciler::Reconciler;

const CALL_TIMEOUT: Duration = Duration::from_millis(200);

struct LocalCluster {
    network: Arc<LocalNetwork>,
    addrs: Vec<String>,
    coordinator: Arc<Coordinator>,
    reconciler: Reconciler,
}

impl LocalCluster {
    async fn start(replicas: usize) -> Result<Self> {
        let addrs: Vec<String> = (0..replicas).map(|i| format!("replica-{i}")).collect();
        let network = Arc::new(LocalNetwork::with_replicas(addrs.clone()));
        let cluster = Arc::new(Cluster::connect(network.as_ref(), &addrs, CALL_TIMEOUT).await?);
        let learner = Arc::new(Learner::new());
        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&cluster),
            Arc::clone(&learner),
            CALL_TIMEOUT,
        ));
        let connector: Arc<dyn Connector> = network.clone();
        let reconciler = Reconciler::new(
            cluster,
            learner,
            connector,
            Duration::from_secs(10),
            CALL_TIMEOUT,
        );
        Ok(Self {
            network,
            addrs,
            coordinator,
            reconciler,
        })
    }

    async fn shell(&self, line: &str) -> String {
        match handle_line(&self.coordinator, line).await {
            ShellReply::Continue(lines) => lines.join("\n"),
            ShellReply::Exit(_) => panic!("unexpected exit for {line:?}"),
        }
    }

    fn assert_converged(&self) {
        let canonical = self.coordinator.learner().canonical();
        for addr in &self.addrs {
            let node = self.network.node(addr).expect("replica exists");
            assert_eq!(node.snapshot(), canonical, "replica {addr} diverged");
        }
    }
}

#[tokio::test]
async fn put_get_delete_through_the_shell() -> Result<()> {
    let cluster = LocalCluster::start(5).await?;

    assert_eq!(cluster.shell("PUT 1000 -20").await, "success");
    assert_eq!(cluster.shell("PUT 1000 -40").await, "refused, key exists");
    assert_eq!(cluster.shell("GET 1000").await, "-20");
    assert_eq!(cluster.shell("DELETE 1000").await, "success");
    assert_eq!(cluster.shell("DELETE 1000").await, "refused, key absent");
    assert_eq!(cluster.shell("g 1000").await, "not found");

    cluster.assert_converged();
    assert_eq!(cluster.coordinator.learner().learned().len(), 2);
    Ok(())
}

#[tokio::test]
async fn shell_reports_bad_input_and_exits() -> Result<()> {
    let cluster = LocalCluster::start(3).await?;

    let reply = cluster.shell("PUT onlykey").await;
    assert!(reply.starts_with("error: PUT requires"), "{reply}");

    let status = cluster.shell("status").await;
    assert!(status.starts_with("3 replicas, quorum 2"), "{status}");

    assert!(matches!(
        handle_line(&cluster.coordinator, "exit").await,
        ShellReply::Exit(_)
    ));
    Ok(())
}

#[tokio::test]
async fn commits_with_two_of_five_down_but_not_three() -> Result<()> {
    let cluster = LocalCluster::start(5).await?;
    cluster.network.partition("replica-3");
    cluster.network.partition("replica-4");

    assert_eq!(cluster.shell("PUT a 1").await, "success");

    cluster.network.partition("replica-2");
    assert_eq!(
        cluster.shell("PUT b 2").await,
        "no majority: 2 promised, 3 required"
    );
    assert_eq!(cluster.coordinator.learner().canonical().len(), 1);

    let reachable = cluster.coordinator.cluster().reachability();
    assert_eq!(reachable.values().filter(|up| **up).count(), 2);
    Ok(())
}

#[tokio::test]
async fn lagging_replicas_catch_up_after_heal() -> Result<()> {
    let cluster = LocalCluster::start(5).await?;
    cluster.network.partition("replica-0");
    cluster.network.partition("replica-1");

    assert!(cluster.coordinator.put("x", "1").await.is_committed());
    assert!(cluster.coordinator.put("y", "2").await.is_committed());

    let report = cluster.reconciler.tick().await;
    assert_eq!(report.unreachable.len(), 2);

    cluster.network.heal("replica-0");
    cluster.network.heal("replica-1");
    let report = cluster.reconciler.tick().await;
    assert_eq!(report.reconnected, vec!["replica-0", "replica-1"]);
    assert_eq!(report.repaired, vec!["replica-0", "replica-1"]);
    assert!(report.converged());
    cluster.assert_converged();

    // Freshly reconnected replicas take part in the next round.
    cluster.network.partition("replica-2");
    cluster.network.partition("replica-3");
    assert!(cluster.coordinator.put("z", "3").await.is_committed());
    Ok(())
}

#[tokio::test]
async fn writes_applied_below_quorum_stay_until_the_next_tick() -> Result<()> {
    let cluster = LocalCluster::start(5).await?;
    let drifted = BTreeMap::from([("p".to_string(), "old".to_string())]);
    for addr in ["replica-2", "replica-3", "replica-4"] {
        cluster
            .network
            .node(addr)
            .expect("replica exists")
            .update_dictionary(drifted.clone());
    }

    let outcome = cluster.coordinator.put("p", "new").await;
    assert!(
        matches!(outcome, Outcome::Rejected { done: 2, required: 3, .. }),
        "{outcome}"
    );
    assert_eq!(outcome.to_string(), "refused, key exists");
    assert!(cluster.coordinator.learner().canonical().is_empty());

    for addr in ["replica-0", "replica-1"] {
        let node = cluster.network.node(addr).expect("replica exists");
        assert_eq!(node.get("p").as_deref(), Some("new"), "{addr} rolled back");
    }

    let report = cluster.reconciler.tick().await;
    assert_eq!(report.repaired.len(), 5);
    cluster.assert_converged();
    assert_eq!(cluster.shell("PUT p fresh").await, "success");
    Ok(())
}

#[tokio::test]
async fn overlapping_writes_do_not_block_later_rounds() -> Result<()> {
    let cluster = LocalCluster::start(3).await?;

    let mut tasks = Vec::new();
    for i in 0..24 {
        let coordinator = Arc::clone(&cluster.coordinator);
        let key = format!("shared-{}", i % 3);
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                coordinator.put(key, i.to_string()).await
            } else {
                coordinator.delete(key).await
            }
        }));
    }
    for task in tasks {
        task.await?;
    }

    cluster.reconciler.tick().await;
    for i in 0..4 {
        let outcome = cluster.coordinator.put(format!("after-{i}"), "v").await;
        assert!(
            matches!(outcome, Outcome::Committed { matched_request: true, .. }),
            "{outcome}"
        );
    }
    cluster.assert_converged();
    Ok(())
}

#[tokio::test]
async fn restarted_replica_is_refilled() -> Result<()> {
    let cluster = LocalCluster::start(3).await?;
    for i in 0..4 {
        assert!(cluster.coordinator.put(format!("k{i}"), format!("v{i}")).await.is_committed());
    }

    cluster.network.restart("replica-1");
    let restarted = cluster.network.node("replica-1").expect("replica exists");
    assert!(restarted.snapshot().is_empty());

    cluster.reconciler.tick().await;
    cluster.assert_converged();
    assert_eq!(restarted.get("k3").as_deref(), Some("v3"));
    Ok(())
}

#[tokio::test]
async fn concurrent_writes_to_distinct_keys_all_commit() -> Result<()> {
    let cluster = LocalCluster::start(5).await?;

    let mut tasks = Vec::new();
    for i in 0..16 {
        let coordinator = Arc::clone(&cluster.coordinator);
        tasks.push(tokio::spawn(async move {
            coordinator.put(format!("key-{i}"), i.to_string()).await
        }));
    }

    let mut proposals = Vec::new();
    for task in tasks {
        let outcome = task.await?;
        assert!(outcome.is_committed(), "{outcome}");
        proposals.push(outcome.proposal());
    }
    proposals.sort_unstable();
    proposals.dedup();
    assert_eq!(proposals.len(), 16);

    assert_eq!(cluster.coordinator.learner().canonical().len(), 16);
    cluster.assert_converged();
    Ok(())
}

#[tokio::test]
async fn warm_up_leaves_the_dictionary_empty() -> Result<()> {
    let cluster = LocalCluster::start(5).await?;

    let lines = warm_up(&cluster.coordinator).await;
    assert_eq!(lines.len(), 17);
    assert_eq!(lines[1], "PUT 1000 -20: success");
    assert_eq!(lines[2], "GET 1000: -20");
    assert_eq!(lines[3], "DELETE 1000: success");
    assert_eq!(lines[13], "PUT 5000 -100: success");

    assert!(cluster.coordinator.learner().canonical().is_empty());
    assert_eq!(cluster.coordinator.learner().learned().len(), 10);
    cluster.assert_converged();
    Ok(())
}
