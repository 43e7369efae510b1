//! S4: a fresh node pulls every account head from a populated peer over the
//! bootstrap listener and converges through by-previous block queries.

mod common;

use common::Harness;
use once_cell::sync::OnceCell;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strand_ledger::Ledger;
use strand_node::bootstrap::{
    start_sync, BootstrapBatch, BootstrapClient, BootstrapListener,
};
use strand_node::message::{BootstrapMode, Message, MessageSender};
use strand_node::node::answer_query;
use strand_node::processor::{BlockFork, BlockOperation};
use strand_node::queries::BlockQueries;
use strand_node::syncer::{ActiveAccounts, Syncer};
use strand_node::test_support::{fixed_key, open_block, seed_genesis, send_block, ONE_STR};
use strand_types::params::{credit_price, EPOCH_TIMESTAMP};
use strand_types::{Amount, U256};

const T0: u64 = EPOCH_TIMESTAMP + 100;

/// Transport fake: query requests are answered synchronously from the
/// server's ledger and fed back into the client's query manager.
struct LoopbackSender {
    server_ledger: Arc<Ledger>,
    client_queries: OnceCell<Arc<BlockQueries>>,
}

impl MessageSender for LoopbackSender {
    fn send(&self, message: &Message, _to: SocketAddr) {
        let Message::Query(query) = message else {
            return;
        };
        if query.is_ack() {
            return;
        }
        let Ok(txn) = self.server_ledger.begin_read() else {
            return;
        };
        let ack = answer_query(&self.server_ledger, &txn, query);
        if let Some(queries) = self.client_queries.get() {
            queries.process_ack(&ack);
        }
    }

    fn broadcast(&self, _message: &Message) {}
}

/// Builds the server ledger: a genesis chain with a few sends and a second
/// account opened from one of them.
fn populate_server(server: &Harness) -> usize {
    let genesis_key = fixed_key(31);
    let other_key = fixed_key(32);
    let sink = fixed_key(33).public_key;

    let genesis = seed_genesis(&server.ledger, &genesis_key, Amount(100 * ONE_STR), T0).unwrap();

    let price = credit_price(T0);
    let funding = Amount(price.0 + 3 * ONE_STR);
    let send1 = Arc::new(send_block(
        &genesis_key,
        &genesis,
        2,
        T0,
        other_key.public_key,
        funding,
    ));
    server.processor.add(send1.clone());
    assert_eq!(server.wait_for(send1.hash(), BlockOperation::Append), "SUCCESS");

    let send2 = Arc::new(send_block(&genesis_key, &send1, 3, T0 + 1, sink, Amount(ONE_STR)));
    server.processor.add(send2.clone());
    assert_eq!(server.wait_for(send2.hash(), BlockOperation::Append), "SUCCESS");

    let open = Arc::new(open_block(
        &other_key,
        send1.hash(),
        funding,
        T0 + 2,
        genesis_key.public_key,
    ));
    server.processor.add(open.clone());
    assert_eq!(server.wait_for(open.hash(), BlockOperation::Append), "SUCCESS");

    2
}

#[test]
fn full_bootstrap_converges() {
    let server = Harness::new(T0 + 10);
    let expected_accounts = populate_server(&server);

    let listener = BootstrapListener::new(
        server.ledger.clone(),
        Arc::new(ActiveAccounts::default()),
        0,
    );
    listener.start().expect("listener binds an ephemeral port");
    let port = listener.local_addr().expect("bound address").port();
    let addr = SocketAddr::from(([127, 0, 0, 1], port));

    // Client node: only the hard-coded genesis record, loopback queries.
    let client = {
        let sender = Arc::new(LoopbackSender {
            server_ledger: server.ledger.clone(),
            client_queries: OnceCell::new(),
        });
        let harness = Harness::new(T0 + 10);
        // Every node ships the genesis record; it is never validated.
        seed_genesis(&harness.ledger, &fixed_key(31), Amount(100 * ONE_STR), T0).unwrap();
        let queries = Arc::new(BlockQueries::new(sender.clone(), harness_peers(&harness)));
        let _ = sender.client_queries.set(queries.clone());
        let syncer = Syncer::new(queries.clone(), harness.processor.clone());
        (harness, syncer)
    };
    let (client_harness, client_syncer) = client;

    // Drive the FULL client loop against the listener.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let batch_id = 0u32;
    runtime.block_on(async {
        let mut bootstrap = BootstrapClient::connect(addr, BootstrapMode::Full)
            .await
            .expect("connect to the listener");
        loop {
            let batch = bootstrap.run().await.expect("one batch");
            let BootstrapBatch::Accounts(entries) = batch else {
                panic!("account mode yields account batches");
            };
            let txn = client_harness.ledger.begin_read().unwrap();
            for entry in &entries {
                start_sync(
                    &client_harness.ledger,
                    &client_syncer,
                    &client_harness.stats,
                    &txn,
                    entry,
                    batch_id,
                );
            }
            drop(txn);
            if bootstrap.finished() {
                break;
            }
        }
    });

    // The loopback answers resolve synchronously; wait for the processor to
    // drain the admitted blocks.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let done = {
            let server_txn = server.ledger.begin_read().unwrap();
            let client_txn = client_harness.ledger.begin_read().unwrap();
            let mut matched = 0usize;
            let mut cursor = U256::ZERO;
            let mut all_match = true;
            while let Some((account, server_info)) = server
                .ledger
                .next_account_info(&server_txn, &cursor)
                .unwrap()
            {
                match client_harness
                    .ledger
                    .account_info_get(&client_txn, &account)
                    .unwrap()
                {
                    Some(client_info)
                        if client_info.head == server_info.head
                            && client_info.head_height == server_info.head_height =>
                    {
                        matched += 1;
                    }
                    _ => all_match = false,
                }
                cursor = account.successor();
            }
            all_match && matched == expected_accounts
        };
        if done {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "client never converged to the server's heads"
        );
        std::thread::sleep(Duration::from_millis(50));
    }

    assert!(client_syncer.finished(batch_id));
    assert_eq!(
        client_harness.stats.get("LEDGER_INCONSISTENT"),
        0,
        "convergence without inconsistency"
    );
    client_harness.assert_weight_invariant();
    listener.stop();
}

/// FORK mode streams stored fork pairs with valid framing.
#[test]
fn fork_bootstrap_streams_pairs() {
    let server = Harness::new(T0 + 10);
    let key = fixed_key(41);
    let dest_a = fixed_key(42).public_key;
    let dest_b = fixed_key(43).public_key;

    let genesis = seed_genesis(&server.ledger, &key, Amount(10 * ONE_STR), T0).unwrap();
    let b1 = Arc::new(send_block(&key, &genesis, 2, T0, dest_a, Amount(1)));
    server.processor.add(b1.clone());
    server.wait_for(b1.hash(), BlockOperation::Append);
    let b2 = Arc::new(send_block(&key, &genesis, 2, T0 + 1, dest_b, Amount(2)));
    server.processor.add_fork(BlockFork {
        first: b1.clone(),
        second: b2.clone(),
        from_local: true,
    });

    // Wait for the fork record.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let txn = server.ledger.begin_read().unwrap();
        if server.ledger.fork_exists(&txn, &key.public_key, 1).unwrap() {
            break;
        }
        drop(txn);
        assert!(Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(20));
    }

    let listener = BootstrapListener::new(
        server.ledger.clone(),
        Arc::new(ActiveAccounts::default()),
        0,
    );
    listener.start().unwrap();
    let port = listener.local_addr().unwrap().port();
    let addr = SocketAddr::from(([127, 0, 0, 1], port));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let pairs = runtime.block_on(async {
        let mut client = BootstrapClient::connect(addr, BootstrapMode::Fork)
            .await
            .unwrap();
        let mut collected = Vec::new();
        loop {
            match client.run().await.unwrap() {
                BootstrapBatch::Forks(mut forks) => collected.append(&mut forks),
                BootstrapBatch::Accounts(_) => panic!("fork mode yields fork batches"),
            }
            if client.finished() {
                return collected;
            }
        }
    });

    assert_eq!(pairs.len(), 1);
    assert!(pairs[0].0.fork_with(&pairs[0].1));
    assert_eq!(pairs[0].0.hash(), b1.hash());
    listener.stop();
}

fn harness_peers(_harness: &Harness) -> Arc<strand_node::peers::Peers> {
    let peers = Arc::new(strand_node::peers::Peers::default());
    // One dummy peer so the query manager has a target; the loopback sender
    // ignores the endpoint anyway.
    peers.insert(U256::from_u64(1), "127.0.0.1:1".parse().unwrap(), Amount(1));
    peers
}
