//! Integration tests for Cluster Membership
//!
//! Runs small clusters over real TCP transports on ephemeral ports.

use node_keeper::membership::{
    JoinStatus, Member, MemberStatus, Membership, MembershipConfig, MembershipEvent,
};
use node_keeper::transport::{TcpTransport, Transportable, UnreachableTransport};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

async fn transport() -> Arc<TcpTransport> {
    Arc::new(
        TcpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap(),
    )
}

fn member_of(name: &str, transport: &dyn Transportable) -> Member {
    Member::new(name, Ipv4Addr::LOCALHOST, transport.local_address().port())
}

fn config(host: Member) -> MembershipConfig {
    MembershipConfig::new()
        .host_member(host)
        .gossip_interval(Duration::from_millis(50))
        .failure_detector_interval(Duration::from_millis(200))
        .ping_timeout(Duration::from_millis(300))
}

/// Poll `condition` until it holds or `timeout` elapses.
async fn eventually(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Start a seed node and one member joining through it.
async fn two_nodes(
    seed_config: impl FnOnce(MembershipConfig) -> MembershipConfig,
    joiner_config: impl FnOnce(MembershipConfig) -> MembershipConfig,
) -> (Arc<Membership>, Arc<Membership>) {
    let ta = transport().await;
    let a = member_of("a", ta.as_ref());
    let (node_a, status) = Membership::init(ta, seed_config(config(a.clone())))
        .await
        .unwrap();
    assert_eq!(status, JoinStatus::SingleNode);

    let tb = transport().await;
    let b = member_of("b", tb.as_ref());
    let cfg = joiner_config(config(b).seed_member(a.clone()).unwrap());
    let (node_b, status) = Membership::init(tb, cfg).await.unwrap();
    assert!(matches!(status, JoinStatus::Joined { seed, .. } if seed == a.address()));

    (node_a, node_b)
}

/// Test a joining node adopts the seed's member list
#[tokio::test]
async fn test_join_through_seed() {
    let (node_a, node_b) = two_nodes(|c| c, |c| c).await;

    assert_eq!(node_b.get_members(), vec![node_a.host(), node_b.host()]);
    assert!(
        eventually(Duration::from_secs(2), || node_a.get_members().len() == 2).await,
        "seed never learned the joiner"
    );

    node_b.shutdown().await;
    node_a.shutdown().await;
}

/// Test the seed observes Up and then Down on a graceful leave
#[tokio::test]
async fn test_graceful_leave_is_down() {
    let ta = transport().await;
    let a = member_of("a", ta.as_ref());
    let (node_a, _) = Membership::init(ta, config(a.clone())).await.unwrap();
    let (tx, mut events) = mpsc::unbounded_channel();
    node_a.subscribe(Arc::new(tx));

    let tb = transport().await;
    let b = member_of("b", tb.as_ref());
    let (node_b, _) = Membership::init(tb, config(b.clone()).seed_member(a).unwrap())
        .await
        .unwrap();

    let up = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(up, MembershipEvent::Up(b.clone()));

    node_b.shutdown().await;

    let down = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(down, MembershipEvent::Down(b.clone()));
    assert_eq!(node_a.get_left_members(), vec![b]);
    assert_eq!(node_a.get_members().len(), 1);

    node_a.shutdown().await;
}

/// Scenario: a silently killed member is suspected by its peer
///
/// The suspicion timeout is raised to 5s to hold the Suspect window open;
/// with the default timeout the member is already Left by the time of the
/// check, which `test_suspicion_expires_to_left` covers.
#[tokio::test]
async fn test_silent_failure_is_suspected() {
    let (node_a, node_b) = two_nodes(
        |c| c.leave_without_notification(true).failure_detector_off(true),
        |c| {
            c.failure_detector_interval(Duration::from_millis(500))
                .suspicion_timeout(Duration::from_secs(5))
        },
    )
    .await;
    let a = node_a.host();
    assert_eq!(node_b.get_members().len(), 2);

    node_a.shutdown().await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(node_b.get_members(), vec![node_b.host()]);
    assert_eq!(node_b.get_suspects(), vec![a.clone()]);
    assert_eq!(node_b.member_status(&a), Some(MemberStatus::Suspect));

    node_b.shutdown().await;
}

/// Test an expired suspicion ends in Left
///
/// Default suspicion timeout with a 500ms detector: two seconds after a
/// silent failure the member is already Left.
#[tokio::test]
async fn test_suspicion_expires_to_left() {
    let (node_a, node_b) = two_nodes(
        |c| c.leave_without_notification(true).failure_detector_off(true),
        |c| c.failure_detector_interval(Duration::from_millis(500)),
    )
    .await;
    let a = node_a.host();
    assert_eq!(
        node_b.config().effective_suspicion_timeout(),
        Duration::from_millis(500)
    );

    node_a.shutdown().await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(node_b.get_left_members(), vec![a.clone()]);
    assert!(node_b.get_suspects().is_empty());
    assert_eq!(node_b.get_members(), vec![node_b.host()]);

    node_b.shutdown().await;
}

/// Test a gracefully departed node restarted on the same address is
/// admitted again
#[tokio::test]
async fn test_restart_on_same_address_rejoins() {
    let (node_a, node_b) = two_nodes(|c| c, |c| c).await;
    let a = node_a.host();
    let b = node_b.host();
    assert!(eventually(Duration::from_secs(2), || node_a.get_members().len() == 2).await);

    node_b.shutdown().await;
    assert!(
        eventually(Duration::from_secs(2), || node_a.get_left_members() == vec![b.clone()]).await,
        "leave never observed"
    );

    let tb = Arc::new(TcpTransport::bind(b.address()).await.unwrap());
    let (restarted, status) = Membership::init(tb, config(b.clone()).seed_member(a).unwrap())
        .await
        .unwrap();
    assert!(matches!(status, JoinStatus::Joined { .. }));

    assert!(
        eventually(Duration::from_secs(5), || {
            node_a.member_status(&b) == Some(MemberStatus::Alive)
                && node_a.get_members().len() == 2
        })
        .await,
        "restarted node never re-admitted: {:?}",
        node_a.member_status(&b)
    );
    assert!(node_a.get_left_members().is_empty());
    assert!(restarted.incarnation() > 1);

    restarted.shutdown().await;
    node_a.shutdown().await;
}

/// Scenario: a severed direct path does not cause suspicion when a relay
/// can still reach the target
#[tokio::test]
async fn test_relay_suppresses_false_suspicion() {
    let tc = transport().await;
    let c = member_of("c", tc.as_ref());
    let (node_c, _) = Membership::init(tc, config(c.clone())).await.unwrap();

    let ta = Arc::new(UnreachableTransport::new(transport().await));
    let tb = Arc::new(UnreachableTransport::new(transport().await));
    let a = member_of("a", ta.as_ref());
    let b = member_of("b", tb.as_ref());
    ta.make_unreachable_to(b.address());
    tb.make_unreachable_to(a.address());

    let slow_suspicion = |m: Member| {
        config(m)
            .suspicion_timeout(Duration::from_secs(10))
            .seed_member(c.clone())
            .unwrap()
    };
    let (node_a, _) = Membership::init(ta, slow_suspicion(a.clone())).await.unwrap();
    let (node_b, _) = Membership::init(tb, slow_suspicion(b.clone())).await.unwrap();

    let everyone = vec![c.clone(), a.clone(), b.clone()];
    assert!(
        eventually(Duration::from_secs(5), || {
            [&node_a, &node_b, &node_c]
                .iter()
                .all(|n| everyone.iter().all(|m| n.get_members().contains(m)))
        })
        .await,
        "cluster never converged"
    );

    // many probe rounds with the direct path cut
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(node_b.get_suspects().is_empty(), "b suspected {:?}", node_b.get_suspects());
    assert!(node_a.get_suspects().is_empty(), "a suspected {:?}", node_a.get_suspects());
    assert_eq!(node_b.get_members().len(), 3);

    node_a.shutdown().await;
    node_b.shutdown().await;
    node_c.shutdown().await;
}

/// Test a seed that is down leaves the join incomplete but the node running
#[tokio::test]
async fn test_join_with_dead_seed_is_incomplete() {
    let dead = member_of("dead", transport().await.as_ref());

    let tb = transport().await;
    let b = member_of("b", tb.as_ref());
    let cfg = config(b.clone())
        .seed_member(dead)
        .unwrap()
        .join_timeout(Duration::from_millis(300));
    let (node_b, status) = Membership::init(tb, cfg).await.unwrap();

    assert!(matches!(status, JoinStatus::Incomplete { .. }));
    assert_eq!(node_b.get_members(), vec![b]);
    assert!(!node_b.is_shutdown());

    node_b.shutdown().await;
}

/// Test a late seed is joined by the background retry
#[tokio::test]
async fn test_join_retried_until_seed_appears() {
    let ta = transport().await;
    let a = member_of("a", ta.as_ref());

    let tb = transport().await;
    let b = member_of("b", tb.as_ref());
    let cfg = config(b).seed_member(a.clone()).unwrap();

    // the seed's listener is up but nobody answers yet
    let (node_b, status) = Membership::init(tb, cfg.join_timeout(Duration::from_millis(200)))
        .await
        .unwrap();
    assert!(matches!(status, JoinStatus::Incomplete { .. }));

    let (node_a, _) = Membership::init(ta, config(a)).await.unwrap();

    assert!(
        eventually(Duration::from_secs(3), || node_b.get_members().len() == 2).await,
        "joiner never retried"
    );

    node_b.shutdown().await;
    node_a.shutdown().await;
}

/// Test actor-system announcements reach other members
#[tokio::test]
async fn test_actor_system_up_propagates() {
    let (node_a, node_b) = two_nodes(|c| c, |c| c).await;
    assert!(eventually(Duration::from_secs(2), || node_a.get_members().len() == 2).await);

    node_b.set_self_actor_system_up();

    let b = node_b.host();
    assert!(
        eventually(Duration::from_secs(2), || node_a.actor_systems() == vec![b.clone()]).await,
        "actor system never announced"
    );

    node_b.shutdown().await;
    node_a.shutdown().await;
}
