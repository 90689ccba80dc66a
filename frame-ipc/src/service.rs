//! Entry point: looks up or creates a session for a recipient address,
//! allocating a Talker if needed, and forwards the signal under that
//! Talker's mutex (spec §4.10).
//!
//! Grounded on `frame::service::Service`'s insert-then-`Scheduled`-handle
//! shape: an `IpcService` is, underneath, a `frame::Service<Talker>` plus
//! the `peer -> Talker` routing table and [`crate::controller::Controller`]
//! ownership spec §4.10 adds on top.

use crate::controller::Controller;
use crate::error::{IpcError, IpcResult};
use crate::talker::{EnqueueSignal, Talker, TalkerConfig};
use frame::identity::ObjectId;
use frame::signal::Signal;
use hashbrown::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::time::Duration;

pub struct IpcService {
    logger: slog::Logger,
    controller: Arc<dyn Controller>,
    talkers: Arc<frame::Service<Talker>>,
    bind_host: IpAddr,
    talker_config: TalkerConfig,
    sessions_per_talker: usize,
    max_talkers: usize,
    talker_ids: RwLock<Vec<ObjectId>>,
    peer_talker: RwLock<HashMap<SocketAddr, ObjectId>>,
}

impl IpcService {
    /// Builds an `IpcService` with a fresh, randomly generated per-process
    /// handshake token (spec §10 item 1's reconnect-token). Use
    /// [`IpcService::with_token`] when a deterministic token is needed (e.g.
    /// tests asserting on a specific reconnect sequence).
    pub fn new(logger: slog::Logger, controller: Arc<dyn Controller>, talkers: Arc<frame::Service<Talker>>, bind_host: IpAddr, config: &frame::config::IpcConfig) -> IpcService {
        IpcService::with_token(logger, controller, talkers, bind_host, config, rand::random())
    }

    pub fn with_token(
        logger: slog::Logger,
        controller: Arc<dyn Controller>,
        talkers: Arc<frame::Service<Talker>>,
        bind_host: IpAddr,
        config: &frame::config::IpcConfig,
        local_token: u32,
    ) -> IpcService {
        IpcService {
            logger,
            controller,
            talkers,
            bind_host,
            talker_config: TalkerConfig {
                max_buffer_size: config.max_buffer_size,
                session_keep_alive: Duration::from_millis(config.keep_alive_interval_ms),
                response_keep_alive: Duration::from_millis(config.keep_alive_interval_ms / 2),
                local_token,
                data_retransmit_count: config.data_retransmit_count.min(u8::MAX as u32) as u8,
                connect_retransmit_count: config.connect_retransmit_count.min(u8::MAX as u32) as u8,
            },
            sessions_per_talker: config.sessions_per_talker,
            max_talkers: config.max_talkers,
            talker_ids: RwLock::new(Vec::new()),
            peer_talker: RwLock::new(HashMap::new()),
        }
    }

    pub fn talker_count(&self) -> usize {
        self.talker_ids.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Enqueue an already-serialized signal for `peer`, allocating a
    /// session (and a Talker, if every existing one is full) as needed.
    pub fn send_signal(&self, peer: SocketAddr, payload: Vec<u8>, flags: u32) -> IpcResult<()> {
        let talker_id = self.talker_for(peer)?;
        let signal: Signal = Box::new(EnqueueSignal { peer, payload, flags });
        self.talkers.signal_message(talker_id, signal).map_err(|_| IpcError::UnknownTalker)?;
        Ok(())
    }

    fn talker_for(&self, peer: SocketAddr) -> IpcResult<ObjectId> {
        if let Some(&id) = self.peer_talker.read().unwrap_or_else(|e| e.into_inner()).get(&peer) {
            return Ok(id);
        }

        let talker_ids = self.talker_ids.read().unwrap_or_else(|e| e.into_inner()).clone();
        let peer_talker = self.peer_talker.read().unwrap_or_else(|e| e.into_inner());
        let mut counts: HashMap<ObjectId, usize> = HashMap::new();
        for &id in peer_talker.values() {
            *counts.entry(id).or_insert(0) += 1;
        }
        drop(peer_talker);

        for &id in &talker_ids {
            if counts.get(&id).copied().unwrap_or(0) < self.sessions_per_talker {
                self.peer_talker.write().unwrap_or_else(|e| e.into_inner()).insert(peer, id);
                return Ok(id);
            }
        }

        if talker_ids.len() >= self.max_talkers {
            return Err(IpcError::TalkerPoolSaturated);
        }

        let bind_addr = SocketAddr::new(self.bind_host, 0);
        let talker = Talker::bind(self.logger.clone(), bind_addr, self.talker_config.clone(), self.controller.clone())
            .map_err(IpcError::BindFailed)?;
        let id = self.talkers.insert(talker);
        let scheduled = self.talkers.scheduled(id).map_err(|_| IpcError::UnknownTalker)?;
        self.controller.schedule_talker(scheduled);

        self.talker_ids.write().unwrap_or_else(|e| e.into_inner()).push(id);
        self.peer_talker.write().unwrap_or_else(|e| e.into_inner()).insert(peer, id);
        slog::info!(self.logger, "spawned talker"; "peer" => %peer);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::NullController;
    use frame::mutexpool::MutexPool;
    use frame::ServiceId;

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn ipc_config() -> frame::config::IpcConfig {
        let mut config = frame::config::IpcConfig::default();
        config.max_talkers = 2;
        config.sessions_per_talker = 1;
        config
    }

    fn service() -> IpcService {
        let talkers = Arc::new(frame::Service::<Talker>::new(
            logger(),
            ServiceId(0),
            Arc::new(MutexPool::with_defaults()),
            |_sid, _id| {},
        ));
        IpcService::with_token(logger(), Arc::new(NullController), talkers, "127.0.0.1".parse().unwrap(), &ipc_config(), 1)
    }

    #[test]
    fn first_send_allocates_a_talker() {
        let service = service();
        service.send_signal("127.0.0.1:9100".parse().unwrap(), b"hi".to_vec(), 0).unwrap();
        assert_eq!(service.talker_count(), 1);
    }

    #[test]
    fn new_peers_spread_across_talkers_once_the_cap_is_hit() {
        let service = service();
        service.send_signal("127.0.0.1:9101".parse().unwrap(), b"a".to_vec(), 0).unwrap();
        service.send_signal("127.0.0.1:9102".parse().unwrap(), b"b".to_vec(), 0).unwrap();
        assert_eq!(service.talker_count(), 2, "sessions_per_talker=1 should force a second talker");
    }

    #[test]
    fn pool_saturation_is_reported_rather_than_silently_dropped() {
        let service = service();
        service.send_signal("127.0.0.1:9103".parse().unwrap(), b"a".to_vec(), 0).unwrap();
        service.send_signal("127.0.0.1:9104".parse().unwrap(), b"b".to_vec(), 0).unwrap();
        let result = service.send_signal("127.0.0.1:9105".parse().unwrap(), b"c".to_vec(), 0);
        assert!(matches!(result, Err(IpcError::TalkerPoolSaturated)));
    }
}
