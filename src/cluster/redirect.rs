//! MOVED and ASK handling.
//!
//! `MOVED` means the slot now lives elsewhere for good: the partition table
//! is updated and the command is retried at the new owner. `ASK` covers a
//! slot mid-migration: the command is retried once at the indicated node,
//! preceded by `ASKING`, and the table is left alone.

use tracing::{debug, warn};

use crate::core::command::server_error;
use crate::core::future::Reply;
use crate::core::multiplexed::MultiplexedConnection;
use crate::proto::frame::Frame;
use crate::{Error, Result};

use super::commands::asking;
use super::router::{parse_address, SlotRouter};

/// Default bound on redirects followed for one command.
pub const DEFAULT_MAX_REDIRECTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Redirect {
    Moved { slot: u16, address: String },
    Ask { slot: u16, address: String },
}

impl Redirect {
    /// Extracts a redirect from an error reply.
    pub(crate) fn from_reply(frame: &Frame) -> Option<Self> {
        let Frame::Error(message) = frame else {
            return None;
        };
        match server_error(message) {
            Error::Moved { slot, address } => Some(Redirect::Moved { slot, address }),
            Error::Ask { slot, address } => Some(Redirect::Ask { slot, address }),
            _ => None,
        }
    }
}

impl SlotRouter {
    /// Re-sends `frame` until a reply other than a redirect arrives.
    ///
    /// Retries are written at once even on connections in manual-flush
    /// mode, since the caller already flushed the original command.
    ///
    /// # Errors
    ///
    /// [`Error::RedirectExhausted`] once `max_redirects` redirects have been
    /// followed without a final answer. Errors opening the redirect target
    /// (for example [`Error::Membership`]) are returned as they are.
    pub(crate) async fn follow_redirects(&self, frame: Frame, mut reply: Frame) -> Result<Frame> {
        let mut attempts = 0;
        while let Some(redirect) = Redirect::from_reply(&reply) {
            if attempts == self.max_redirects {
                warn!(attempts, "giving up after too many redirects");
                return Err(Error::RedirectExhausted { attempts });
            }
            attempts += 1;

            reply = match redirect {
                Redirect::Moved { slot, address } => {
                    warn!(slot, %address, attempts, "slot moved");
                    let connection = self.apply_moved(slot, &address)?;
                    retry(&connection, frame.clone()).await?
                }
                Redirect::Ask { slot, address } => {
                    debug!(slot, %address, attempts, "asked to retry elsewhere");
                    let connection = self.connection_for_address(&address)?;
                    ask(&connection, frame.clone()).await?
                }
            };
        }
        Ok(reply)
    }

    /// Points `slot` at the node listening on `address` and returns a
    /// connection to it.
    fn apply_moved(&self, slot: u16, address: &str) -> Result<MultiplexedConnection> {
        let (host, port) = parse_address(address)?;
        match self.partitions.relocate_slot(slot, host, port) {
            Some(owner) => Ok(self.registry.for_node(&owner)),
            // Not a known member; the registry decides whether it may be used.
            None => self.registry.by_address(host, port),
        }
    }
}

async fn retry(connection: &MultiplexedConnection, frame: Frame) -> Result<Frame> {
    let reply = connection
        .dispatch_now(vec![frame])
        .pop()
        .ok_or_else(|| Error::Protocol {
            message: "redirect retry lost its reply".to_string(),
        })?;
    reply.await
}

/// Sends `ASKING` and `frame` back to back and returns the command's reply.
async fn ask(connection: &MultiplexedConnection, frame: Frame) -> Result<Frame> {
    let replies = connection.dispatch_now(vec![asking().into_frame(), frame]);
    let [asking_reply, reply]: [Reply; 2] = replies.try_into().map_err(|_| Error::Protocol {
        message: "ASKING batch lost a reply".to_string(),
    })?;
    let asked = asking_reply.await?;
    if asked.is_error() {
        return Ok(asked);
    }
    reply.await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redirect_from_reply() {
        assert_eq!(
            Redirect::from_reply(&Frame::error("MOVED 3999 127.0.0.1:7000")),
            Some(Redirect::Moved {
                slot: 3999,
                address: "127.0.0.1:7000".to_string()
            })
        );
        assert_eq!(
            Redirect::from_reply(&Frame::error("ASK 1 10.0.0.1:7001")),
            Some(Redirect::Ask {
                slot: 1,
                address: "10.0.0.1:7001".to_string()
            })
        );
        assert_eq!(Redirect::from_reply(&Frame::error("ERR other")), None);
        assert_eq!(Redirect::from_reply(&Frame::ok()), None);
    }
}
