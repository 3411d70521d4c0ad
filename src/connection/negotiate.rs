//! Protocol negotiation: the runtime upgrade from text to binary framing.
//!
//! Both upgrade forms are carried as ordinary text call frames with id 1
//! and a function name that no application uses: a carriage return
//! followed by one mode octet. A peer that understands the handshake
//! switches its read direction to binary on sight; a peer that also sees
//! the ack-requested form replies with the literal acknowledgement (param
//! `O`=`K`, then the return frame for id 1) before doing so. The
//! acknowledgement is always emitted as raw text bytes, because the
//! requesting side may have switched its reader to binary already; its
//! binary path recognizes the literal.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::connection::dispatch::{Shared, SlotHandler};
use crate::connection::ProtocolMode;
use crate::error::Result;

/// Upgrade request: the sender switches to binary without waiting
pub(crate) const UPGRADE: &[u8] = b"\r\x00\x071\n";

/// Upgrade request that asks for an acknowledgement (`prefer_binary`)
pub(crate) const UPGRADE_WITH_ACK: &[u8] = b"\r\x01\x071\n";

/// Acknowledgement: param line `O\tK`, then the return frame for id 1
pub(crate) const ACK: &[u8] = b"O\tK\n\x071\n";

/// True when a decoded function name is one of the two upgrade requests
pub(crate) fn is_upgrade_request(func: &[u8]) -> bool {
    func.len() == 2 && func[0] == b'\r' && (func[1] == 0x00 || func[1] == 0x01)
}

/// True when the request asks for the acknowledgement round-trip
pub(crate) fn wants_ack(func: &[u8]) -> bool {
    func == b"\r\x01"
}

/// One-shot state of the `prefer_binary` handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Negotiation {
    /// Configuration does not gate calls on a handshake
    NotRequested,
    /// Handshake still to be performed by the first caller
    Pending,
    /// A caller is performing it; others wait
    InFlight,
    /// Performed (successfully or not); never retried
    Settled,
}

impl Shared {
    /// Gate for outbound user calls: with `prefer_binary`, the first
    /// caller performs the handshake and everyone else blocks until it
    /// settles. A single attempt is made per connection.
    pub(crate) fn ensure_negotiated(self: &Arc<Self>) -> Result<()> {
        if self.config.protocol != ProtocolMode::PreferBinary {
            return Ok(());
        }
        let mut negotiation = self.negotiation.lock().unwrap();
        loop {
            match *negotiation {
                Negotiation::NotRequested | Negotiation::Settled => return Ok(()),
                Negotiation::InFlight => {
                    negotiation = self.negotiated.wait(negotiation).unwrap();
                }
                Negotiation::Pending => {
                    *negotiation = Negotiation::InFlight;
                    break;
                }
            }
        }
        drop(negotiation);

        let outcome = self.run_negotiation();

        let mut negotiation = self.negotiation.lock().unwrap();
        *negotiation = Negotiation::Settled;
        self.negotiated.notify_all();
        drop(negotiation);
        outcome
    }

    /// Send the ack-requesting upgrade and wait for the id 1 return. The
    /// writer switches to binary only when the peer acknowledged with
    /// exactly `{O: K}`; any other reply (or a closed transport) keeps
    /// text framing.
    fn run_negotiation(self: &Arc<Self>) -> Result<()> {
        self.register_receiver(
            Some(1),
            SlotHandler::Absent {
                issued_at: "protocol negotiation".to_string(),
            },
        );
        if let Err(e) = self.transmit_literal(UPGRADE_WITH_ACK) {
            self.remove_receiver(Some(1));
            return Err(e);
        }
        let reply = self.wait_for(Some(1))?;
        let acknowledged = matches!(
            &reply,
            Some(bag) if bag.len() == 1 && bag.get("O") == Some(&b"K"[..])
        );
        if acknowledged {
            self.write.lock().unwrap().switch_to_binary();
            self.write_is_binary.store(true, Ordering::Release);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upgrade_request_recognition() {
        assert!(is_upgrade_request(b"\r\x00"));
        assert!(is_upgrade_request(b"\r\x01"));
        assert!(!is_upgrade_request(b"\r\x02"));
        assert!(!is_upgrade_request(b"\r"));
        assert!(!is_upgrade_request(b"echo"));
    }

    #[test]
    fn test_ack_wanted_only_for_acked_form() {
        assert!(wants_ack(b"\r\x01"));
        assert!(!wants_ack(b"\r\x00"));
    }

    #[test]
    fn test_literals_are_single_text_frames() {
        // Both requests are one LF-terminated line carrying id 1.
        for literal in [UPGRADE, UPGRADE_WITH_ACK] {
            assert_eq!(literal.last(), Some(&b'\n'));
            assert_eq!(literal.iter().filter(|&&b| b == b'\n').count(), 1);
            assert!(literal.contains(&0x07));
        }
        // The ack is two frames: the param line and the return line.
        assert_eq!(ACK.iter().filter(|&&b| b == b'\n').count(), 2);
    }
}
