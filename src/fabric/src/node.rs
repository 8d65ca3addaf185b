//! In-memory node fabric.
//!
//! Each attached node gets an inbox and a small pool of polling threads that
//! hand requests to the node's [`MessageHandler`]. `send_reply_timeout` is
//! the single RPC primitive: enqueue a request carrying a one-shot reply
//! channel, then block for the fixed-size reply with a bounded timeout.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{debug, warn};
use zerocopy::AsBytes;

use crate::wire::Opcode;

pub type NodeId = u32;

#[derive(Debug, Clone, Error)]
pub enum FabricError {
    #[error("node {0} is not attached to the fabric")]
    NodeDown(NodeId),
    #[error("timed out waiting for reply to {0:?}")]
    Timeout(Opcode),
    #[error("peer went away before replying to {0:?}")]
    Disconnected(Opcode),
}

/// Per-message routing header. Only the source node survives transport; the
/// payload carries everything else.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub src_nid: NodeId,
}

/// A delivered request: decoded opcode, raw payload, and the reply
/// descriptor the handler must eventually fire exactly once.
pub struct Request {
    pub opcode: Opcode,
    pub hdr: Header,
    pub payload: Vec<u8>,
    pub reply: ReplyDesc,
}

/// One-shot reply slot. Dropping it without replying wakes the sender with
/// a disconnect error, which surfaces as an I/O-style failure.
pub struct ReplyDesc {
    opcode: Opcode,
    tx: Sender<Vec<u8>>,
}

impl ReplyDesc {
    pub fn reply<T: AsBytes>(self, msg: &T) {
        self.reply_raw(msg.as_bytes().to_vec());
    }

    pub fn reply_raw(self, bytes: Vec<u8>) {
        if self.tx.send(bytes).is_err() {
            // Sender gave up (timeout); nothing to do but note it.
            debug!(opcode = ?self.opcode, "reply dropped: requester no longer waiting");
        }
    }
}

/// A node's request dispatcher. Implementations route on `req.opcode`,
/// decode the payload, and fire `req.reply`.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, req: Request);
}

#[derive(Default)]
struct FabricInner {
    nodes: Mutex<FxHashMap<NodeId, Sender<Request>>>,
    sent: Mutex<FxHashMap<Opcode, u64>>,
}

/// Handle to the shared fabric. Cheap to clone; all clones see the same
/// node table.
#[derive(Clone, Default)]
pub struct Fabric {
    inner: Arc<FabricInner>,
}

impl Fabric {
    pub fn new() -> Fabric {
        Fabric::default()
    }

    /// Attach a node and spawn its polling threads. The returned runner owns
    /// the threads; dropping it detaches the node and winds them down.
    pub fn attach(
        &self,
        nid: NodeId,
        handler: Arc<dyn MessageHandler>,
        polling_threads: usize,
    ) -> NodeRunner {
        let (tx, rx) = unbounded::<Request>();

        let prev = self.inner.nodes.lock().insert(nid, tx);
        assert!(prev.is_none(), "node {nid} attached twice");

        let threads = (0..polling_threads.max(1))
            .map(|i| {
                let rx = rx.clone();
                let handler = Arc::clone(&handler);
                thread::Builder::new()
                    .name(format!("node{nid} poll{i}"))
                    .spawn(move || poll_loop(nid, rx, handler))
                    .expect("failed to spawn polling thread")
            })
            .collect();

        NodeRunner {
            nid,
            fabric: self.clone(),
            threads,
        }
    }

    /// Send `payload` to `dst` and block for the reply.
    ///
    /// Times out after `timeout`; a timed-out operation is not retried here,
    /// higher layers decide. The reply is the raw fixed-size struct bytes.
    pub fn send_reply_timeout(
        &self,
        src: NodeId,
        dst: NodeId,
        opcode: Opcode,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, FabricError> {
        let tx = self
            .inner
            .nodes
            .lock()
            .get(&dst)
            .cloned()
            .ok_or(FabricError::NodeDown(dst))?;

        *self.inner.sent.lock().entry(opcode).or_insert(0) += 1;

        let (reply_tx, reply_rx) = bounded(1);
        let req = Request {
            opcode,
            hdr: Header { src_nid: src },
            payload: payload.to_vec(),
            reply: ReplyDesc {
                opcode,
                tx: reply_tx,
            },
        };
        tx.send(req).map_err(|_| FabricError::NodeDown(dst))?;

        match reply_rx.recv_timeout(timeout) {
            Ok(bytes) => Ok(bytes),
            Err(RecvTimeoutError::Timeout) => {
                warn!(?opcode, dst, "rpc timed out");
                Err(FabricError::Timeout(opcode))
            }
            Err(RecvTimeoutError::Disconnected) => Err(FabricError::Disconnected(opcode)),
        }
    }

    /// How many requests of `opcode` this fabric has carried.
    pub fn sent_count(&self, opcode: Opcode) -> u64 {
        self.inner.sent.lock().get(&opcode).copied().unwrap_or(0)
    }

    fn detach(&self, nid: NodeId) {
        self.inner.nodes.lock().remove(&nid);
    }
}

fn poll_loop(nid: NodeId, rx: Receiver<Request>, handler: Arc<dyn MessageHandler>) {
    while let Ok(req) = rx.recv() {
        handler.handle(req);
    }
    debug!(nid, "polling thread exiting");
}

/// Owns a node's polling threads. Detaches the node on drop and joins the
/// threads once the inbox drains.
pub struct NodeRunner {
    nid: NodeId,
    fabric: Fabric,
    threads: Vec<thread::JoinHandle<()>>,
}

impl NodeRunner {
    pub fn nid(&self) -> NodeId {
        self.nid
    }
}

impl Drop for NodeRunner {
    fn drop(&mut self) {
        self.fabric.detach(self.nid);
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{P2mMunmap, P2mMunmapReply};
    use zerocopy::FromBytes;

    struct Echo;

    impl MessageHandler for Echo {
        fn handle(&self, req: Request) {
            let p = P2mMunmap::read_from_prefix(req.payload.as_slice()).unwrap();
            req.reply.reply(&P2mMunmapReply {
                status: p.addr + p.len,
            });
        }
    }

    #[test]
    fn request_reply() {
        let fabric = Fabric::new();
        let _node = fabric.attach(1, Arc::new(Echo), 2);

        let payload = P2mMunmap {
            pid: 1,
            _pad: 0,
            addr: 0x1000,
            len: 0x2000,
        };
        let bytes = fabric
            .send_reply_timeout(
                0,
                1,
                Opcode::P2mMunmap,
                payload.as_bytes(),
                Duration::from_secs(1),
            )
            .unwrap();
        let reply = P2mMunmapReply::read_from_prefix(bytes.as_slice()).unwrap();
        assert_eq!(reply.status, 0x3000);
        assert_eq!(fabric.sent_count(Opcode::P2mMunmap), 1);
    }

    #[test]
    fn unknown_node() {
        let fabric = Fabric::new();
        assert!(matches!(
            fabric.send_reply_timeout(0, 9, Opcode::P2mBrk, &[], Duration::from_millis(10)),
            Err(FabricError::NodeDown(9))
        ));
    }

    struct Mute;

    impl MessageHandler for Mute {
        fn handle(&self, req: Request) {
            // Swallow the reply descriptor without firing it.
            drop(req);
        }
    }

    #[test]
    fn dropped_reply_is_disconnect() {
        let fabric = Fabric::new();
        let _node = fabric.attach(3, Arc::new(Mute), 1);
        assert!(matches!(
            fabric.send_reply_timeout(0, 3, Opcode::P2mBrk, &[0; 16], Duration::from_secs(1)),
            Err(FabricError::Disconnected(Opcode::P2mBrk))
        ));
    }

    #[test]
    fn detach_on_drop() {
        let fabric = Fabric::new();
        let node = fabric.attach(5, Arc::new(Echo), 1);
        drop(node);
        assert!(matches!(
            fabric.send_reply_timeout(0, 5, Opcode::P2mBrk, &[], Duration::from_millis(10)),
            Err(FabricError::NodeDown(5))
        ));
    }
}
