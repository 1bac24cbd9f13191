// Leader lease handover integration test: two replicas racing for the same
// `leader:peer_manager` lease, with the second only able to take over once
// the first's lease expires.

use foghorn::federation_cache::FederationCache;
use foghorn::kv::memory::MemoryKv;
use foghorn::kv::SharedKV;
use foghorn::types::ClusterId;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn only_one_replica_holds_the_lease_at_a_time_and_it_transfers_on_expiry() {
    let kv = Arc::new(MemoryKv::new());
    let fed_cache = FederationCache::new(ClusterId::new("cluster-a"), kv.clone());
    let lease_key = fed_cache.leader_lease_key();
    let lease_ttl = Duration::from_millis(30);

    // replica-1 and replica-2 start simultaneously and race for the lease.
    let replica_1_won = kv.set_if_absent(&lease_key, "replica-1".to_string(), lease_ttl).await.unwrap();
    let replica_2_won = kv.set_if_absent(&lease_key, "replica-2".to_string(), lease_ttl).await.unwrap();
    assert!(replica_1_won);
    assert!(!replica_2_won, "two replicas must not simultaneously win the same lease");

    // replica-1 keeps renewing; replica-2 can neither win nor renew.
    assert!(kv.renew_lease(&lease_key, "replica-1", lease_ttl).await.unwrap());
    assert!(!kv.renew_lease(&lease_key, "replica-2", lease_ttl).await.unwrap());

    // replica-1 is killed: its lease is left to expire rather than
    // explicitly released, exercising the TTL handover path rather than the
    // cooperative `step_down` path.
    tokio::time::sleep(lease_ttl * 2).await;

    // replica-2's next polling attempt must now succeed.
    assert!(!kv.renew_lease(&lease_key, "replica-1", lease_ttl).await.unwrap());
    let replica_2_takeover = kv.set_if_absent(&lease_key, "replica-2".to_string(), lease_ttl).await.unwrap();
    assert!(replica_2_takeover);

    // replica-2 now owns the lease exclusively.
    assert!(kv.renew_lease(&lease_key, "replica-2", lease_ttl).await.unwrap());
    assert!(!kv.renew_lease(&lease_key, "replica-1", lease_ttl).await.unwrap());
}
