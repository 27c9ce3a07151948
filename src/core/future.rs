//! Future handles for dispatched commands.
//!
//! A command is handed to its connection as soon as it is issued; the
//! [`CommandFuture`] returned to the caller only observes the reply. Waiting
//! on a handle with a timeout never cancels the command, and a handle can be
//! waited on repeatedly until it settles.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::oneshot;

use crate::proto::frame::Frame;
use crate::{Error, Result};

/// Receiver side of a single request sent over a node connection.
///
/// Resolves to [`Error::ConnectionClosed`] if the connection drops the
/// request without answering.
#[derive(Debug)]
pub struct Reply {
    rx: oneshot::Receiver<Result<Frame>>,
}

impl Reply {
    pub(crate) fn new(rx: oneshot::Receiver<Result<Frame>>) -> Self {
        Self { rx }
    }
}

impl Future for Reply {
    type Output = Result<Frame>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::ConnectionClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

enum State<T> {
    Pending(BoxFuture<'static, Result<T>>),
    Done(Result<T>),
    Taken,
}

/// Handle to the typed outcome of one dispatched command.
///
/// Awaiting the handle consumes it. [`wait`](CommandFuture::wait) and
/// [`poll_done`](CommandFuture::poll_done) settle it in place instead, so the
/// result stays available through [`result`](CommandFuture::result).
pub struct CommandFuture<T> {
    state: State<T>,
}

impl<T> Unpin for CommandFuture<T> {}

impl<T: Send + 'static> CommandFuture<T> {
    /// Wraps an arbitrary future producing the command outcome.
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            state: State::Pending(future.boxed()),
        }
    }

    /// A handle that is already settled.
    pub fn ready(result: Result<T>) -> Self {
        Self {
            state: State::Done(result),
        }
    }

    /// Converts the raw reply with `convert` once it arrives.
    pub fn from_reply(reply: Reply, convert: fn(Frame) -> Result<T>) -> Self {
        Self::new(async move { convert(reply.await?) })
    }

    /// Maps a successful outcome.
    pub fn map<U, F>(self, f: F) -> CommandFuture<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        match self.state {
            State::Pending(fut) => CommandFuture::new(async move { fut.await.map(f) }),
            State::Done(result) => CommandFuture::ready(result.map(f)),
            State::Taken => CommandFuture::ready(Err(consumed())),
        }
    }

    /// Polls once without blocking and reports whether the outcome is known.
    pub fn poll_done(&mut self) -> bool {
        if let State::Pending(fut) = &mut self.state {
            match fut.now_or_never() {
                Some(result) => self.state = State::Done(result),
                None => return false,
            }
        }
        true
    }

    /// Returns true if the outcome has already been observed.
    pub fn is_done(&self) -> bool {
        !matches!(self.state, State::Pending(_))
    }

    /// Drives the command until it settles, keeping the outcome in place.
    ///
    /// Dropping the returned future early leaves the command pending.
    pub async fn wait(&mut self) {
        if let State::Pending(fut) = &mut self.state {
            let result = fut.await;
            self.state = State::Done(result);
        }
    }

    /// The settled outcome, if any.
    pub fn result(&self) -> Option<&Result<T>> {
        match &self.state {
            State::Done(result) => Some(result),
            _ => None,
        }
    }

    /// Takes the settled outcome out of the handle.
    pub fn take_result(&mut self) -> Option<Result<T>> {
        match std::mem::replace(&mut self.state, State::Taken) {
            State::Done(result) => Some(result),
            other => {
                self.state = other;
                None
            }
        }
    }
}

impl<T> Future for CommandFuture<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            State::Pending(fut) => match fut.as_mut().poll(cx) {
                Poll::Ready(result) => {
                    this.state = State::Taken;
                    Poll::Ready(result)
                }
                Poll::Pending => Poll::Pending,
            },
            State::Done(_) => match std::mem::replace(&mut this.state, State::Taken) {
                State::Done(result) => Poll::Ready(result),
                _ => Poll::Ready(Err(consumed())),
            },
            State::Taken => Poll::Ready(Err(consumed())),
        }
    }
}

impl<T> std::fmt::Debug for CommandFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            State::Pending(_) => "pending",
            State::Done(Ok(_)) => "done",
            State::Done(Err(_)) => "failed",
            State::Taken => "taken",
        };
        f.debug_struct("CommandFuture").field("state", &state).finish()
    }
}

fn consumed() -> Error {
    Error::Protocol {
        message: "command future polled after completion".to_string(),
    }
}

/// Waits until every handle settles or `timeout` elapses.
///
/// Returns true if all of them settled in time. Handles that did not settle
/// stay pending and can still complete later.
pub async fn await_all<'a, T, I>(timeout: Duration, futures: I) -> bool
where
    T: Send + 'static,
    I: IntoIterator<Item = &'a mut CommandFuture<T>>,
{
    let waits = futures.into_iter().map(|f| f.wait());
    tokio::time::timeout(timeout, futures::future::join_all(waits))
        .await
        .is_ok()
}
