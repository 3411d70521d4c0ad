//! Dispatch state machine: receiver slots, pending answers, and the
//! cooperative wait loop.
//!
//! The engine owns no threads. Whichever caller currently holds the read
//! lock acts as the reader ("read-duty") and drives the dispatcher: it
//! parses exactly one logical frame at a time and either accumulates a
//! param pair, queues an inbound call on its receiver's slot, or publishes
//! a completed answer. Every other waiter parks on the completion
//! condition and is woken after each dispatched frame, at which point it
//! either consumes its own completion or takes over read-duty.
//!
//! Lock order: the answers lock (`state`) is always released before
//! blocking on transport I/O or invoking user handler code; the read lock
//! is only ever acquired with `try_lock` from the wait loop, so the two
//! never deadlock. The write lock is independent and held only across one
//! frame emission plus flush.

use std::collections::{HashMap, VecDeque};
use std::io::{BufReader, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, TryLockError};

use crate::call::Call;
use crate::connection::negotiate::{self, Negotiation};
use crate::connection::{ConnectionConfig, HandlerAction, ProtocolMode};
use crate::error::{Error, Result};
use crate::lazy::{Answer, LazyAnswer};
use crate::params::ParamBag;
use crate::protocol::frame::{Frame, FrameReader, FrameWriter, WireMode};

pub(crate) type HandlerFn = dyn Fn(&mut Call) -> HandlerAction + Send + Sync;

/// Handler registered for an outstanding call (or the anonymous receiver)
pub(crate) enum SlotHandler {
    Fn(Arc<HandlerFn>),
    /// No handler was supplied; the recorded call site feeds the
    /// diagnostic if a call-back arrives anyway
    Absent { issued_at: String },
}

/// Per-outstanding-call state: the handler plus call-backs parsed but not
/// yet yielded to it
pub(crate) struct ReceiverSlot {
    pub(crate) handler: SlotHandler,
    pub(crate) queue: VecDeque<Call>,
}

/// Read side of the transport plus the bag being accumulated.
///
/// Only the read-lock holder touches `partial`, so it needs no further
/// synchronization: param frames accumulate here until a call or return
/// frame consumes the group.
pub(crate) struct ReadHalf {
    pub(crate) frames: FrameReader<BufReader<Box<dyn Read + Send>>>,
    pub(crate) partial: ParamBag,
}

#[derive(Default)]
pub(crate) struct DispatchState {
    /// Receiver slots keyed by call id; `None` is the anonymous receiver
    pub(crate) receivers: HashMap<Option<u32>, ReceiverSlot>,
    /// Completions that arrived while their caller was not yet blocking
    pub(crate) answers: HashMap<u32, ParamBag>,
    /// Sticky: set by `detach`, observed at the next read attempt
    pub(crate) detached: bool,
    /// Sticky: the peer closed the transport cleanly
    pub(crate) closed: bool,
    /// Sticky: the transport or framing failed; fanned out to all waiters
    pub(crate) failure: Option<Arc<Error>>,
}

/// State shared by every handle, call context, and lazy answer of one
/// connection
pub(crate) struct Shared {
    pub(crate) config: ConnectionConfig,
    pub(crate) read: Mutex<ReadHalf>,
    pub(crate) write: Mutex<FrameWriter<Box<dyn Write + Send>>>,
    pub(crate) state: Mutex<DispatchState>,
    pub(crate) completed: Condvar,
    pub(crate) ids: Mutex<u32>,
    pub(crate) negotiation: Mutex<Negotiation>,
    pub(crate) negotiated: Condvar,
    /// Mirrors of the framing modes, readable without taking the I/O locks
    pub(crate) read_is_binary: AtomicBool,
    pub(crate) write_is_binary: AtomicBool,
}

impl Shared {
    /// Allocate the next call id. Ids wrap modulo 2^32; 0 is never used,
    /// and 1 is skipped whenever the configuration requests binary framing
    /// (the negotiator reserves it).
    pub(crate) fn next_id(&self) -> u32 {
        let reserve_one = matches!(
            self.config.protocol,
            ProtocolMode::Binary | ProtocolMode::PreferBinary
        );
        let mut next = self.ids.lock().unwrap();
        loop {
            let id = *next;
            *next = next.wrapping_add(1);
            if id == 0 || (id == 1 && reserve_one) {
                continue;
            }
            return id;
        }
    }

    pub(crate) fn transmit_call(
        &self,
        func: &[u8],
        params: &ParamBag,
        id: Option<u32>,
        recv_id: Option<u32>,
    ) -> Result<()> {
        let mut writer = self.write.lock().unwrap();
        writer.send_call(func, params, id, recv_id)?;
        Ok(())
    }

    pub(crate) fn transmit_return(&self, id: Option<u32>, params: &ParamBag) -> Result<()> {
        let mut writer = self.write.lock().unwrap();
        writer.send_return(id, params)?;
        Ok(())
    }

    pub(crate) fn transmit_literal(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.write.lock().unwrap();
        writer.send_literal(bytes)?;
        Ok(())
    }

    pub(crate) fn register_receiver(&self, key: Option<u32>, handler: SlotHandler) {
        let mut state = self.state.lock().unwrap();
        state.receivers.insert(
            key,
            ReceiverSlot {
                handler,
                queue: VecDeque::new(),
            },
        );
    }

    pub(crate) fn remove_receiver(&self, key: Option<u32>) {
        self.state.lock().unwrap().receivers.remove(&key);
    }

    /// Allocate an id, register its receiver, put the call frame on the
    /// wire, and wait (or hand back a lazy answer).
    pub(crate) fn initiate(
        self: &Arc<Self>,
        func: &[u8],
        params: &ParamBag,
        handler: SlotHandler,
        recv_id: Option<u32>,
    ) -> Result<Answer> {
        self.ensure_negotiated()?;
        let id = self.next_id();
        self.register_receiver(Some(id), handler);
        if let Err(e) = self.transmit_call(func, params, Some(id), recv_id) {
            self.remove_receiver(Some(id));
            return Err(e);
        }
        if self.config.lazy_answers {
            Ok(Answer::Lazy(LazyAnswer::new(Arc::clone(self), id)))
        } else {
            self.wait_for(Some(id)).map(Answer::Ready)
        }
    }

    /// Mark the connection detached. The next read attempt (not one
    /// already blocking) observes the flag; in-flight writes are not
    /// cancelled.
    pub(crate) fn detach(&self) {
        self.state.lock().unwrap().detached = true;
        self.completed.notify_all();
    }

    /// The wait loop: block until the call identified by `key` completes,
    /// serving its queued call-backs and taking read-duty along the way.
    ///
    /// Returns `Ok(Some(bag))` for a delivered completion and `Ok(None)`
    /// when the loop ended without one (handler exit, transport closed).
    /// On every exit path the receiver slot for `key` is removed.
    pub(crate) fn wait_for(self: &Arc<Self>, key: Option<u32>) -> Result<Option<ParamBag>> {
        let mut state = self.state.lock().unwrap();
        loop {
            // 1. a call-back queued for this receiver
            let mut popped = None;
            if let Some(slot) = state.receivers.get_mut(&key) {
                if let SlotHandler::Fn(handler) = &slot.handler {
                    let handler = Arc::clone(handler);
                    if let Some(call) = slot.queue.pop_front() {
                        popped = Some((call, handler));
                    }
                }
            }
            if let Some((mut call, handler)) = popped {
                drop(state);
                let action = handler(&mut call);
                let exiting = matches!(
                    &action,
                    HandlerAction::ReplyAndExit(_) | HandlerAction::Exit
                );
                let replied = match action {
                    HandlerAction::Reply(bag) | HandlerAction::ReplyAndExit(bag) => {
                        if call.answered() {
                            Ok(())
                        } else {
                            call.answer(bag)
                        }
                    }
                    HandlerAction::Continue | HandlerAction::Exit => Ok(()),
                };
                if let Err(e) = replied {
                    self.remove_receiver(key);
                    return Err(e);
                }
                if exiting {
                    self.remove_receiver(key);
                    return Ok(None);
                }
                state = self.state.lock().unwrap();
                continue;
            }

            // 2. this call's completion already arrived
            if let Some(id) = key {
                if let Some(bag) = state.answers.remove(&id) {
                    state.receivers.remove(&key);
                    return Ok(Some(bag));
                }
            }

            // 3. connection-level outcomes
            if let Some(failure) = &state.failure {
                let failure = failure.replicate();
                state.receivers.remove(&key);
                return Err(failure);
            }
            if state.closed {
                state.receivers.remove(&key);
                return Ok(None);
            }
            if state.detached {
                state.receivers.remove(&key);
                return Err(Error::Detached);
            }

            // 4. take read-duty, or wait for whoever holds it
            match self.read.try_lock() {
                Ok(mut read_half) => {
                    drop(state);
                    let outcome = self.receive_one(&mut read_half);
                    drop(read_half);
                    state = self.state.lock().unwrap();
                    match outcome {
                        Ok(()) => {}
                        Err(e) if e.is_disconnect() => state.closed = true,
                        Err(e @ (Error::Io(_) | Error::InvalidResponse(_))) => {
                            state.failure = Some(Arc::new(e));
                        }
                        Err(e) => {
                            // Dispatch-level error (no receiver, handler
                            // missing): surfaces to the read-duty holder;
                            // the connection stays usable.
                            state.receivers.remove(&key);
                            drop(state);
                            self.completed.notify_all();
                            return Err(e);
                        }
                    }
                    self.completed.notify_all();
                }
                Err(TryLockError::WouldBlock) => {
                    state = self.completed.wait(state).unwrap();
                }
                Err(TryLockError::Poisoned(e)) => panic!("read half poisoned: {}", e),
            }
        }
    }

    /// Parse exactly one logical frame and dispatch it. Called with the
    /// read lock held and the answers lock released.
    fn receive_one(self: &Arc<Self>, read_half: &mut ReadHalf) -> Result<()> {
        let frame = match read_half.frames.read_frame()? {
            Some(frame) => frame,
            None => {
                self.state.lock().unwrap().closed = true;
                return Ok(());
            }
        };
        match frame {
            Frame::Param { key, value } => {
                // First occurrence of a key wins within one frame group.
                read_half.partial.insert(key, value);
                Ok(())
            }
            Frame::Call { func, id, recv_id } => {
                if id == Some(1)
                    && recv_id.is_none()
                    && read_half.frames.mode() == WireMode::Text
                    && self.config.protocol != ProtocolMode::OnlyText
                    && negotiate::is_upgrade_request(&func)
                {
                    read_half.frames.switch_to_binary();
                    self.read_is_binary.store(true, Ordering::Release);
                    if negotiate::wants_ack(&func) {
                        self.transmit_literal(negotiate::ACK)?;
                    }
                    return Ok(());
                }
                let params = std::mem::take(&mut read_half.partial);
                let func = String::from_utf8_lossy(&func).into_owned();
                let call = Call::new(Arc::downgrade(self), func.clone(), params, id);
                let mut state = self.state.lock().unwrap();
                match state.receivers.get_mut(&recv_id) {
                    Some(slot) => match &slot.handler {
                        SlotHandler::Fn(_) => {
                            slot.queue.push_back(call);
                            drop(state);
                            self.completed.notify_all();
                            Ok(())
                        }
                        SlotHandler::Absent { issued_at } => Err(Error::NoHandler {
                            func,
                            issued_at: issued_at.clone(),
                        }),
                    },
                    None => match recv_id {
                        Some(recv_id) => Err(Error::CallReturned { func, recv_id }),
                        None => Err(Error::NoCallbackDefined { func }),
                    },
                }
            }
            Frame::Return { id } => {
                let bag = std::mem::take(&mut read_half.partial);
                if let Some(id) = id {
                    let mut state = self.state.lock().unwrap();
                    // Publish only for a live outstanding call; a return
                    // whose caller already went away is dropped, so the
                    // table never accumulates dead ids.
                    if state.receivers.contains_key(&Some(id)) {
                        state.answers.insert(id, bag);
                    }
                    drop(state);
                    self.completed.notify_all();
                }
                Ok(())
            }
        }
    }
}
