//! Maintenance inverse offers, filter expiry, and recovery pause/resume.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use strata_allocator::{
    spawn, AgentCapabilities, AgentId, AgentInfo, AllocatorOptions, FrameworkId, FrameworkSpec,
    HierarchicalAllocator, InverseOfferResponse, InverseOfferStatus, InverseOffers, Offers,
    Refusal, ResourceQuantities, Unavailability,
};
use strata_resources::Resources;

fn res(s: &str) -> Resources {
    s.parse().unwrap()
}

fn quantities(s: &str) -> ResourceQuantities {
    s.parse().unwrap()
}

type OfferLog = Arc<Mutex<Vec<(FrameworkId, Offers)>>>;
type InverseLog = Arc<Mutex<Vec<(FrameworkId, InverseOffers)>>>;

fn engine_with_logs(options: AllocatorOptions) -> (HierarchicalAllocator, OfferLog, InverseLog) {
    let offers: OfferLog = Arc::new(Mutex::new(Vec::new()));
    let inverse: InverseLog = Arc::new(Mutex::new(Vec::new()));
    let offer_sink = Arc::clone(&offers);
    let inverse_sink = Arc::clone(&inverse);
    let engine = HierarchicalAllocator::new(
        options,
        Box::new(move |id, o| offer_sink.lock().unwrap().push((id.clone(), o))),
        Box::new(move |id, o| inverse_sink.lock().unwrap().push((id.clone(), o))),
    );
    (engine, offers, inverse)
}

fn run_cycle(engine: &mut HierarchicalAllocator) {
    engine.trigger_allocation_all();
    engine.run_allocation_cycle();
}

fn schedule() -> Unavailability {
    Unavailability {
        start: Utc::now(),
        duration: Some(Duration::from_secs(3600)),
    }
}

#[tokio::test(start_paused = true)]
async fn maintenance_emits_one_inverse_offer() {
    // S3: one inverse offer per (framework, agent) until the framework
    // responds; responses clear the outstanding flag; refusals filter.
    let (mut engine, _offers, inverse) = engine_with_logs(AllocatorOptions::default());

    let fw = FrameworkId::new("fw-1");
    let agent = AgentId::new("agent-1");

    engine.add_framework(
        &fw,
        FrameworkSpec::with_roles(["dev"]),
        HashMap::new(),
        true,
        BTreeSet::new(),
    );
    engine.add_agent(
        &agent,
        AgentInfo::new("host1"),
        AgentCapabilities::default(),
        Some(schedule()),
        res("cpus:4"),
        HashMap::new(),
    );

    // The first cycle both offers the agent and, now that the framework
    // holds allocation there, emits the inverse offer.
    run_cycle(&mut engine);
    {
        let log = inverse.lock().unwrap();
        assert_eq!(log.len(), 1);
        let (framework, offers) = &log[0];
        assert_eq!(framework, &fw);
        let unavailable = &offers[&agent];
        assert!(unavailable.resources.is_empty());
        assert_eq!(unavailable.unavailability.duration, Some(Duration::from_secs(3600)));
    }

    // Outstanding: a second cycle emits nothing new.
    run_cycle(&mut engine);
    assert_eq!(inverse.lock().unwrap().len(), 1);

    // The framework accepts; the flag clears and the status is recorded.
    engine.update_inverse_offer(
        &agent,
        &fw,
        Some(InverseOfferStatus {
            response: InverseOfferResponse::Accept,
            updated_at: Utc::now(),
        }),
        None,
    );
    let statuses = engine.inverse_offer_statuses();
    assert_eq!(
        statuses[&agent][&fw].response,
        InverseOfferResponse::Accept
    );

    // With the flag cleared a new inverse offer goes out.
    run_cycle(&mut engine);
    assert_eq!(inverse.lock().unwrap().len(), 2);

    // Respond again, this time refusing inverse offers for 60 seconds.
    engine.update_inverse_offer(&agent, &fw, None, Some(Refusal { refuse_seconds: 60.0 }));
    run_cycle(&mut engine);
    assert_eq!(inverse.lock().unwrap().len(), 2, "filtered for 60 seconds");

    // Once the refusal lapses the inverse offer resumes.
    tokio::time::advance(Duration::from_secs(61)).await;
    run_cycle(&mut engine);
    assert_eq!(inverse.lock().unwrap().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn unavailability_change_clears_inverse_filters() {
    let (mut engine, _offers, inverse) = engine_with_logs(AllocatorOptions::default());

    let fw = FrameworkId::new("fw-1");
    let agent = AgentId::new("agent-1");

    engine.add_framework(
        &fw,
        FrameworkSpec::with_roles(["dev"]),
        HashMap::new(),
        true,
        BTreeSet::new(),
    );
    engine.add_agent(
        &agent,
        AgentInfo::new("host1"),
        AgentCapabilities::default(),
        Some(schedule()),
        res("cpus:4"),
        HashMap::new(),
    );

    run_cycle(&mut engine);
    assert_eq!(inverse.lock().unwrap().len(), 1);

    engine.update_inverse_offer(&agent, &fw, None, Some(Refusal { refuse_seconds: 3600.0 }));
    run_cycle(&mut engine);
    assert_eq!(inverse.lock().unwrap().len(), 1);

    // A new schedule forces reassessment: filters are dropped and the
    // outstanding flag was already cleared by the response.
    engine.update_unavailability(&agent, Some(schedule()));
    run_cycle(&mut engine);
    assert_eq!(inverse.lock().unwrap().len(), 2);

    // Clearing maintenance stops inverse offers entirely.
    engine.update_unavailability(&agent, None);
    run_cycle(&mut engine);
    assert_eq!(inverse.lock().unwrap().len(), 2);
    assert!(engine.inverse_offer_statuses().is_empty());
}

#[test]
fn recovery_pauses_until_enough_agents() {
    // S6: expectedAgents = 10 → threshold 8; the eighth agent resumes.
    let (mut engine, offers, _inverse) = engine_with_logs(AllocatorOptions::default());

    engine.add_framework(
        &FrameworkId::new("fw-1"),
        FrameworkSpec::with_roles(["prod"]),
        HashMap::new(),
        true,
        BTreeSet::new(),
    );

    let mut quotas = BTreeMap::new();
    quotas.insert("prod".to_string(), quantities("cpus:1"));
    engine.recover(10, quotas);

    assert!(engine.is_paused());
    assert_eq!(engine.quota_guarantee("prod"), Some(&quantities("cpus:1")));

    for i in 0..7 {
        engine.add_agent(
            &AgentId::new(format!("agent-{i}")),
            AgentInfo::new(format!("host-{i}")),
            AgentCapabilities::default(),
            None,
            res("cpus:4"),
            HashMap::new(),
        );
        assert!(engine.is_paused(), "paused after {} agents", i + 1);

        // Paused cycles short-circuit without offers.
        engine.run_allocation_cycle();
        assert!(offers.lock().unwrap().is_empty());
    }

    engine.add_agent(
        &AgentId::new("agent-7"),
        AgentInfo::new("host-7"),
        AgentCapabilities::default(),
        None,
        res("cpus:4"),
        HashMap::new(),
    );
    assert!(!engine.is_paused(), "eighth agent completes recovery");

    engine.run_allocation_cycle();
    assert!(!offers.lock().unwrap().is_empty());
}

#[test]
fn recovery_skipped_without_quota_or_agents() {
    let (mut engine, _offers, _inverse) = engine_with_logs(AllocatorOptions::default());
    engine.recover(10, BTreeMap::new());
    assert!(!engine.is_paused());

    // A threshold that rounds to zero means no recovery either, but the
    // quotas are still installed.
    let (mut engine, _offers, _inverse) = engine_with_logs(AllocatorOptions::default());
    let mut quotas = BTreeMap::new();
    quotas.insert("prod".to_string(), quantities("cpus:1"));
    engine.recover(1, quotas);
    assert!(!engine.is_paused());
    assert!(engine.quota_guarantee("prod").is_some());
}

// =============================================================================
// Actor-driven timing scenarios
// =============================================================================

fn spawn_with_log(options: AllocatorOptions) -> (strata_allocator::AllocatorHandle, OfferLog) {
    let offers: OfferLog = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&offers);
    let handle = spawn(
        options,
        Box::new(move |id, o| sink.lock().unwrap().push((id.clone(), o))),
        Box::new(|_, _| {}),
    );
    (handle, offers)
}

async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn offer_filter_expires_after_refusal_window() {
    // S4: refuseSeconds=5 with a 1s allocation interval suppresses
    // re-offers for the full 5 seconds, then the filter self-removes and
    // the periodic cycle re-offers.
    let (handle, offers) = spawn_with_log(AllocatorOptions {
        allocation_interval: Duration::from_secs(1),
        ..AllocatorOptions::default()
    });

    let fw = FrameworkId::new("fw-1");
    let agent = AgentId::new("agent-1");

    handle
        .add_framework(
            fw.clone(),
            FrameworkSpec::with_roles(["dev"]),
            HashMap::new(),
            true,
            BTreeSet::new(),
        )
        .unwrap();
    handle
        .add_agent(
            agent.clone(),
            AgentInfo::new("host1"),
            AgentCapabilities::default(),
            None,
            res("cpus:4"),
            HashMap::new(),
        )
        .unwrap();
    settle().await;

    let declined = {
        let mut log = offers.lock().unwrap();
        assert_eq!(log.len(), 1);
        let (_, received) = log.remove(0);
        received["dev"][&agent].clone()
    };

    handle
        .recover_resources(
            fw.clone(),
            agent.clone(),
            declined,
            Some(Refusal { refuse_seconds: 5.0 }),
        )
        .unwrap();
    settle().await;

    // Cycles keep running but the (framework, agent) pair stays filtered.
    tokio::time::advance(Duration::from_secs(4)).await;
    settle().await;
    assert!(
        offers.lock().unwrap().is_empty(),
        "resources must not be re-offered before the refusal lapses"
    );

    // Past the 5 second mark the filter expires and a later cycle
    // re-offers.
    tokio::time::advance(Duration::from_secs(3)).await;
    settle().await;
    tokio::time::advance(Duration::from_secs(1)).await;
    settle().await;
    assert!(!offers.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn short_refusal_is_stretched_to_allocation_interval() {
    // With a 10s allocation interval, a 1-second refusal still lasts until
    // the next cycle can observe it.
    let (handle, offers) = spawn_with_log(AllocatorOptions {
        allocation_interval: Duration::from_secs(10),
        ..AllocatorOptions::default()
    });

    let fw = FrameworkId::new("fw-1");
    let agent = AgentId::new("agent-1");

    handle
        .add_framework(
            fw.clone(),
            FrameworkSpec::with_roles(["dev"]),
            HashMap::new(),
            true,
            BTreeSet::new(),
        )
        .unwrap();
    handle
        .add_agent(
            agent.clone(),
            AgentInfo::new("host1"),
            AgentCapabilities::default(),
            None,
            res("cpus:4"),
            HashMap::new(),
        )
        .unwrap();
    settle().await;

    let declined = {
        let mut log = offers.lock().unwrap();
        let (_, received) = log.remove(0);
        received["dev"][&agent].clone()
    };

    handle
        .recover_resources(
            fw.clone(),
            agent.clone(),
            declined,
            Some(Refusal { refuse_seconds: 1.0 }),
        )
        .unwrap();
    settle().await;

    // An explicit allocation two seconds in is still filtered: the
    // effective timeout is max(10s, 1s).
    tokio::time::advance(Duration::from_secs(2)).await;
    handle.allocate().unwrap();
    settle().await;
    assert!(offers.lock().unwrap().is_empty());

    // Once the stretched window has lapsed (and the expiry message has
    // been processed), an explicit allocation re-offers.
    tokio::time::advance(Duration::from_secs(9)).await;
    settle().await;
    handle.allocate().unwrap();
    settle().await;
    assert!(!offers.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn inverse_offer_statuses_roundtrip_through_handle() {
    let inverse: InverseLog = Arc::new(Mutex::new(Vec::new()));
    let inverse_sink = Arc::clone(&inverse);
    let handle = spawn(
        AllocatorOptions::default(),
        Box::new(|_, _| {}),
        Box::new(move |id, o| inverse_sink.lock().unwrap().push((id.clone(), o))),
    );

    let fw = FrameworkId::new("fw-1");
    let agent = AgentId::new("agent-1");

    handle
        .add_framework(
            fw.clone(),
            FrameworkSpec::with_roles(["dev"]),
            HashMap::new(),
            true,
            BTreeSet::new(),
        )
        .unwrap();
    handle
        .add_agent(
            agent.clone(),
            AgentInfo::new("host1"),
            AgentCapabilities::default(),
            Some(schedule()),
            res("cpus:4"),
            HashMap::new(),
        )
        .unwrap();
    settle().await;

    assert_eq!(inverse.lock().unwrap().len(), 1);

    handle
        .update_inverse_offer(
            agent.clone(),
            fw.clone(),
            Some(InverseOfferStatus {
                response: InverseOfferResponse::Decline,
                updated_at: Utc::now(),
            }),
            None,
        )
        .unwrap();

    let statuses = handle.inverse_offer_statuses().await.unwrap();
    assert_eq!(
        statuses[&agent][&fw].response,
        InverseOfferResponse::Decline
    );
}
