//! Fixtures for testing the client.

#![allow(dead_code)]

use std::sync::Arc;

use memnet::KvRequest;
use memnet::KvResponse;
use memnet::MemNet;
use raft_client::protocol::CommandConsistency;
use raft_client::protocol::QueryConsistency;
use raft_client::Address;
use raft_client::Config;
use raft_client::Operation;
use raft_client::RaftClient;
#[allow(unused_imports)]
use pretty_assertions::assert_eq;
#[allow(unused_imports)]
use pretty_assertions::assert_ne;
use tracing_subscriber::prelude::*;

/// A concrete client type used during testing.
pub type MemClient = RaftClient<KvRequest, KvResponse, MemNet>;

/// Initialize the tracing system.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default()
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::FULL)
        .with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

pub fn addr(port: u16) -> Address {
    Address::new("localhost", port)
}

pub fn three_members() -> Vec<Address> {
    vec![addr(5001), addr(5002), addr(5003)]
}

/// A client wired to a simulated cluster.
pub struct Harness {
    pub net: MemNet,
    pub client: MemClient,
    pub members: Vec<Address>,
}

pub struct Builder {
    members: Vec<Address>,
    leader: Option<Address>,
    grant_timeout: u64,
}

/// Start building a three node cluster harness with the first member as leader.
pub fn harness() -> Builder {
    Builder {
        members: three_members(),
        leader: Some(addr(5001)),
        grant_timeout: memnet::DEFAULT_GRANT_TIMEOUT,
    }
}

impl Builder {
    pub fn members(mut self, members: Vec<Address>) -> Self {
        self.members = members;
        self
    }

    pub fn leader(mut self, leader: Address) -> Self {
        self.leader = Some(leader);
        self
    }

    pub fn grant_timeout(mut self, millis: u64) -> Self {
        self.grant_timeout = millis;
        self
    }

    pub fn build(self) -> Harness {
        let net = MemNet::new(self.members.clone());
        net.set_leader(self.leader);
        net.set_grant_timeout(self.grant_timeout);
        let config = Config::build("test".into())
            .members(self.members.clone())
            .validate()
            .expect("failed to build client config");
        let client = RaftClient::new(Arc::new(config), Arc::new(net.clone()));
        Harness {
            net,
            client,
            members: self.members,
        }
    }
}

pub fn put(key: &str, value: &str) -> Operation<KvRequest> {
    Operation::Command {
        payload: KvRequest::Put {
            key: key.to_string(),
            value: value.to_string(),
        },
        consistency: CommandConsistency::Linearizable,
    }
}

pub fn get(key: &str) -> Operation<KvRequest> {
    Operation::Query {
        payload: KvRequest::Get { key: key.to_string() },
        consistency: QueryConsistency::Linearizable,
    }
}
