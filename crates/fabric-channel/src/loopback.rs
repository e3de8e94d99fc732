//! In-process transport
//!
//! Behaves like a reliable-connected verbs device whose queue pairs all live
//! in one process: a send consumes the oldest receive posted on the
//! destination queue pair, copies the bytes between registered regions and
//! produces one completion on each side. Missing receives and bad keys come
//! back as error completions, the way a NIC reports them.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::transport::{
    Completion, CompletionKind, CompletionStatus, CqId, MemoryKeys, QpId, RdmaTransport, TransportError,
    WorkRequest,
};

#[derive(Debug, Clone, Copy)]
struct Registration {
    addr: u64,
    len: u64,
}

impl Registration {
    fn covers(&self, addr: u64, len: u32) -> bool {
        addr >= self.addr
            && (addr - self.addr)
                .checked_add(len as u64)
                .is_some_and(|end| end <= self.len)
    }
}

#[derive(Debug)]
struct QueuePair {
    cq: CqId,
    peer: Option<QpId>,
    recv_queue: VecDeque<WorkRequest>,
}

#[derive(Debug, Default)]
struct Device {
    registrations: HashMap<u32, Registration>,
    queue_pairs: HashMap<QpId, QueuePair>,
    completion_queues: HashMap<CqId, VecDeque<Completion>>,
    next_key: u32,
    next_qp: QpId,
    next_cq: CqId,
}

impl Device {
    fn push(&mut self, cq: CqId, completion: Completion) {
        if let Some(queue) = self.completion_queues.get_mut(&cq) {
            queue.push_back(completion);
        }
    }

    fn valid(&self, wr: &WorkRequest) -> bool {
        self.registrations
            .get(&wr.lkey)
            .is_some_and(|r| r.covers(wr.addr, wr.len))
    }
}

/// Loopback device shared by every endpoint of a test or single-node run
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    device: Mutex<Device>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// New, empty completion queue
    pub fn create_cq(&self) -> CqId {
        let mut dev = self.device.lock();
        let cq = dev.next_cq;
        dev.next_cq += 1;
        dev.completion_queues.insert(cq, VecDeque::new());
        cq
    }

    /// New queue pair reporting to `cq`
    pub fn create_qp(&self, cq: CqId) -> Result<QpId, TransportError> {
        let mut dev = self.device.lock();
        if !dev.completion_queues.contains_key(&cq) {
            return Err(TransportError::UnknownCq(cq));
        }
        let qp = dev.next_qp;
        dev.next_qp += 1;
        dev.queue_pairs.insert(
            qp,
            QueuePair {
                cq,
                peer: None,
                recv_queue: VecDeque::new(),
            },
        );
        Ok(qp)
    }

    /// Connect two queue pairs to each other
    pub fn connect(&self, a: QpId, b: QpId) -> Result<(), TransportError> {
        let mut dev = self.device.lock();
        for qp in [a, b] {
            if !dev.queue_pairs.contains_key(&qp) {
                return Err(TransportError::UnknownQp(qp));
            }
        }
        if let Some(qp) = dev.queue_pairs.get_mut(&a) {
            qp.peer = Some(b);
        }
        if let Some(qp) = dev.queue_pairs.get_mut(&b) {
            qp.peer = Some(a);
        }
        Ok(())
    }

    /// Receives posted on `qp` and not yet consumed
    pub fn posted_recvs(&self, qp: QpId) -> usize {
        self.device
            .lock()
            .queue_pairs
            .get(&qp)
            .map_or(0, |qp| qp.recv_queue.len())
    }

    /// Completions waiting on `cq`
    pub fn pending_completions(&self, cq: CqId) -> usize {
        self.device
            .lock()
            .completion_queues
            .get(&cq)
            .map_or(0, VecDeque::len)
    }

    fn deliver(dev: &mut Device, qp: QpId, dest: Option<QpId>, wr: WorkRequest) -> Result<(), TransportError> {
        let (send_cq, peer) = {
            let src = dev.queue_pairs.get(&qp).ok_or(TransportError::UnknownQp(qp))?;
            (src.cq, dest.or(src.peer))
        };
        let dest_qp = peer.ok_or(TransportError::NotConnected(qp))?;

        let send_completion = |status, byte_len| Completion {
            wr_id: wr.wr_id,
            status,
            kind: CompletionKind::Send,
            byte_len,
            qp,
        };

        if !dev.valid(&wr) {
            dev.push(send_cq, send_completion(CompletionStatus::LocalProtection, 0));
            return Ok(());
        }

        let (recv_cq, recv) = {
            let dst = dev
                .queue_pairs
                .get_mut(&dest_qp)
                .ok_or(TransportError::UnknownQp(dest_qp))?;
            (dst.cq, dst.recv_queue.pop_front())
        };
        let Some(recv) = recv else {
            tracing::debug!(qp, dest_qp, wr_id = wr.wr_id, "receiver not ready");
            dev.push(send_cq, send_completion(CompletionStatus::ReceiverNotReady, 0));
            return Ok(());
        };

        let recv_completion = |status, byte_len| Completion {
            wr_id: recv.wr_id,
            status,
            kind: CompletionKind::Recv,
            byte_len,
            qp: dest_qp,
        };

        if !dev.valid(&recv) {
            dev.push(recv_cq, recv_completion(CompletionStatus::LocalProtection, 0));
            dev.push(send_cq, send_completion(CompletionStatus::RemoteInvalidRequest, 0));
            return Ok(());
        }
        if recv.len < wr.len {
            dev.push(recv_cq, recv_completion(CompletionStatus::LocalLength, 0));
            dev.push(send_cq, send_completion(CompletionStatus::RemoteInvalidRequest, 0));
            return Ok(());
        }

        // SAFETY: both ranges were checked against live registrations, whose
        // owners promised the memory stays valid while registered.
        unsafe {
            std::ptr::copy(wr.addr as *const u8, recv.addr as *mut u8, wr.len as usize);
        }

        dev.push(recv_cq, recv_completion(CompletionStatus::Success, wr.len));
        dev.push(send_cq, send_completion(CompletionStatus::Success, wr.len));
        Ok(())
    }
}

impl RdmaTransport for LoopbackTransport {
    unsafe fn register_memory(&self, addr: u64, len: u64) -> Result<MemoryKeys, TransportError> {
        if addr == 0 || addr.checked_add(len).is_none() {
            return Err(TransportError::Registration(format!(
                "cannot register ({addr:#x}, {len})"
            )));
        }
        let mut dev = self.device.lock();
        dev.next_key += 1;
        let key = dev.next_key;
        dev.registrations.insert(key, Registration { addr, len });
        Ok(MemoryKeys { lkey: key, rkey: key })
    }

    fn deregister_memory(&self, lkey: u32) -> Result<(), TransportError> {
        self.device
            .lock()
            .registrations
            .remove(&lkey)
            .map(|_| ())
            .ok_or(TransportError::UnknownKey(lkey))
    }

    fn post_send(&self, qp: QpId, dest: Option<QpId>, wr: WorkRequest) -> Result<(), TransportError> {
        let mut dev = self.device.lock();
        Self::deliver(&mut dev, qp, dest, wr)
    }

    fn post_send_batch(&self, qp: QpId, dest: Option<QpId>, wrs: &[WorkRequest]) -> Result<(), TransportError> {
        let mut dev = self.device.lock();
        for wr in wrs {
            Self::deliver(&mut dev, qp, dest, *wr)?;
        }
        Ok(())
    }

    fn post_recv(&self, qp: QpId, wr: WorkRequest) -> Result<(), TransportError> {
        self.post_recv_batch(qp, std::slice::from_ref(&wr))
    }

    fn post_recv_batch(&self, qp: QpId, wrs: &[WorkRequest]) -> Result<(), TransportError> {
        let mut dev = self.device.lock();
        let queue = dev.queue_pairs.get_mut(&qp).ok_or(TransportError::UnknownQp(qp))?;
        queue.recv_queue.extend(wrs.iter().copied());
        Ok(())
    }

    fn poll_completions(&self, cq: CqId, max: usize) -> Vec<Completion> {
        let mut dev = self.device.lock();
        match dev.completion_queues.get_mut(&cq) {
            Some(queue) => {
                let n = max.min(queue.len());
                queue.drain(..n).collect()
            }
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Pair {
        transport: LoopbackTransport,
        cq: CqId,
        a: QpId,
        b: QpId,
    }

    fn pair() -> Pair {
        let transport = LoopbackTransport::new();
        let cq = transport.create_cq();
        let a = transport.create_qp(cq).unwrap();
        let b = transport.create_qp(cq).unwrap();
        transport.connect(a, b).unwrap();
        Pair { transport, cq, a, b }
    }

    #[test]
    fn test_send_lands_in_oldest_recv() {
        let p = pair();
        let src = b"hello".to_vec();
        let mut first = vec![0u8; 8];
        let mut second = vec![0u8; 8];

        let (src_keys, first_keys, second_keys) = unsafe {
            (
                p.transport.register_memory(src.as_ptr() as u64, 5).unwrap(),
                p.transport.register_memory(first.as_mut_ptr() as u64, 8).unwrap(),
                p.transport.register_memory(second.as_mut_ptr() as u64, 8).unwrap(),
            )
        };

        let recv = |wr_id, buf: &mut Vec<u8>, lkey| WorkRequest {
            wr_id,
            addr: buf.as_mut_ptr() as u64,
            len: 8,
            lkey,
        };
        p.transport.post_recv(p.b, recv(10, &mut first, first_keys.lkey)).unwrap();
        p.transport.post_recv(p.b, recv(11, &mut second, second_keys.lkey)).unwrap();

        let send = WorkRequest {
            wr_id: 1,
            addr: src.as_ptr() as u64,
            len: 5,
            lkey: src_keys.lkey,
        };
        p.transport.post_send(p.a, None, send).unwrap();

        let completions = p.transport.poll_completions(p.cq, 16);
        assert_eq!(completions.len(), 2);
        assert_eq!(completions[0].wr_id, 10);
        assert_eq!(completions[0].kind, CompletionKind::Recv);
        assert_eq!(completions[0].byte_len, 5);
        assert_eq!(completions[1].wr_id, 1);
        assert!(completions.iter().all(Completion::is_success));

        assert_eq!(&first[..5], b"hello");
        assert_eq!(second, vec![0; 8]);
        assert_eq!(p.transport.posted_recvs(p.b), 1);
    }

    #[test]
    fn test_error_completions() {
        let p = pair();
        let mut buf = vec![0u8; 4];
        let keys = unsafe { p.transport.register_memory(buf.as_mut_ptr() as u64, 4).unwrap() };
        let wr = WorkRequest {
            wr_id: 5,
            addr: buf.as_mut_ptr() as u64,
            len: 4,
            lkey: keys.lkey,
        };

        p.transport.post_send(p.a, None, wr).unwrap();
        let c = p.transport.poll_completions(p.cq, 4);
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].status, CompletionStatus::ReceiverNotReady);

        p.transport.post_send(p.a, None, WorkRequest { len: 5, ..wr }).unwrap();
        let c = p.transport.poll_completions(p.cq, 4);
        assert_eq!(c[0].status, CompletionStatus::LocalProtection);

        p.transport.deregister_memory(keys.lkey).unwrap();
        assert_eq!(
            p.transport.deregister_memory(keys.lkey),
            Err(TransportError::UnknownKey(keys.lkey))
        );
    }

    #[test]
    fn test_post_errors() {
        let transport = LoopbackTransport::new();
        let cq = transport.create_cq();
        let lonely = transport.create_qp(cq).unwrap();
        let wr = WorkRequest {
            wr_id: 0,
            addr: 0,
            len: 0,
            lkey: 0,
        };

        assert_eq!(transport.create_qp(99), Err(TransportError::UnknownCq(99)));
        assert_eq!(transport.post_send(lonely, None, wr), Err(TransportError::NotConnected(lonely)));
        assert_eq!(transport.post_recv(42, wr), Err(TransportError::UnknownQp(42)));
        assert!(transport.poll_completions(99, 8).is_empty());
    }

    #[test]
    fn test_poll_respects_max() {
        let p = pair();
        let wr = WorkRequest {
            wr_id: 0,
            addr: 0,
            len: 0,
            lkey: 0,
        };
        for _ in 0..5 {
            p.transport.post_send(p.a, None, wr).unwrap();
        }
        assert_eq!(p.transport.pending_completions(p.cq), 5);
        assert_eq!(p.transport.poll_completions(p.cq, 3).len(), 3);
        assert_eq!(p.transport.poll_completions(p.cq, 3).len(), 2);
    }
}
