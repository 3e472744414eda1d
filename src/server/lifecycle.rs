//-
// Copyright (c) 2026, The Mailgate developers
//
// This file is part of Mailgate.
//
// Mailgate is free software: you can  redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Mailgate is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Mailgate. If not, see <http://www.gnu.org/licenses/>.

//! Ordered start-up and shutdown of the long-running services.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{error, info, warn};

use super::context::Context;
use super::listener::{self, Protocol, SessionFn};
use crate::mailbox::cache::MailboxCache;
use crate::support::cancel::CancelToken;
use crate::support::error::Error;

pub trait Service: Send {
    fn name(&self) -> &str;
    fn start(&mut self) -> Result<(), Error>;
    /// Stop the service and wait for its threads. Must tolerate being called
    /// on a service which never started.
    fn stop(&mut self);
}

/// An explicit list of services, started in order and stopped in reverse.
#[derive(Default)]
pub struct Lifecycle {
    services: Vec<Box<dyn Service>>,
    started: usize,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, service: impl Service + 'static) {
        self.services.push(Box::new(service));
    }

    /// Start every service in order.
    ///
    /// If one fails, those already started are stopped again and the error
    /// is returned.
    pub fn start_all(&mut self) -> Result<(), Error> {
        while self.started < self.services.len() {
            let service = &mut self.services[self.started];
            if let Err(e) = service.start() {
                error!("Failed to start {}: {}", service.name(), e);
                self.stop_all();
                return Err(e);
            }
            info!("Started {}", service.name());
            self.started += 1;
        }
        Ok(())
    }

    pub fn stop_all(&mut self) {
        while self.started > 0 {
            self.started -= 1;
            let service = &mut self.services[self.started];
            service.stop();
            info!("Stopped {}", service.name());
        }
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        self.stop_all();
    }
}

pub(crate) fn join(name: &str, handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        if handle.join().is_err() {
            warn!("{} thread panicked", name);
        }
    }
}

/// Periodically disposes idle mailboxes, and disposes all of them on stop.
pub struct CacheService {
    cache: Arc<MailboxCache>,
    interval: Duration,
    parent: CancelToken,
    cancel: Option<CancelToken>,
    handle: Option<JoinHandle<()>>,
}

impl CacheService {
    pub fn new(ctx: &Context, interval: Duration) -> Self {
        CacheService {
            cache: Arc::clone(&ctx.cache),
            interval,
            parent: ctx.cancel.clone(),
            cancel: None,
            handle: None,
        }
    }
}

impl Service for CacheService {
    fn name(&self) -> &str {
        "mailbox cache sweeper"
    }

    fn start(&mut self) -> Result<(), Error> {
        let cancel = self.parent.child();
        self.handle = Some(MailboxCache::start_sweeper(
            Arc::clone(&self.cache),
            self.interval,
            cancel.clone(),
        ));
        self.cancel = Some(cancel);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        let handle = self.handle.take();
        join(self.name(), handle);

        let disposed = self.cache.dispose_all();
        if disposed > 0 {
            info!("Disposed {} open mailboxes", disposed);
        }
    }
}

/// The accept loop of one protocol.
pub struct ListenerService {
    ctx: Arc<Context>,
    protocol: Protocol,
    listen: String,
    session: SessionFn,
    cancel: Option<CancelToken>,
    handle: Option<JoinHandle<()>>,
}

impl ListenerService {
    pub fn new(
        ctx: Arc<Context>,
        protocol: Protocol,
        listen: String,
        session: SessionFn,
    ) -> Self {
        ListenerService {
            ctx,
            protocol,
            listen,
            session,
            cancel: None,
            handle: None,
        }
    }
}

impl Service for ListenerService {
    fn name(&self) -> &str {
        match self.protocol {
            Protocol::Pop3 => "POP3 listener",
            Protocol::Smtp => "SMTP listener",
        }
    }

    fn start(&mut self) -> Result<(), Error> {
        let socket = listener::bind(&self.listen)?;
        let cancel = self.ctx.cancel.child();
        self.handle = Some(listener::spawn(
            Arc::clone(&self.ctx),
            self.protocol,
            socket,
            self.session,
            cancel.clone(),
        )?);
        self.cancel = Some(cancel);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        let handle = self.handle.take();
        join(self.name(), handle);
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use super::*;

    struct Recorder {
        name: &'static str,
        fail: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Service for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn start(&mut self) -> Result<(), Error> {
            if self.fail {
                return Err(Error::Protocol("no".to_owned()));
            }
            self.log.lock().unwrap().push(format!("start {}", self.name));
            Ok(())
        }

        fn stop(&mut self) {
            self.log.lock().unwrap().push(format!("stop {}", self.name));
        }
    }

    fn recorder(
        name: &'static str,
        fail: bool,
        log: &Arc<Mutex<Vec<String>>>,
    ) -> Recorder {
        Recorder {
            name,
            fail,
            log: Arc::clone(log),
        }
    }

    #[test]
    fn stops_in_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut lifecycle = Lifecycle::new();
        lifecycle.add(recorder("cache", false, &log));
        lifecycle.add(recorder("pop3", false, &log));
        lifecycle.add(recorder("smtp", false, &log));

        lifecycle.start_all().unwrap();
        lifecycle.stop_all();
        // Already stopped, so dropping does nothing more
        drop(lifecycle);

        assert_eq!(
            vec![
                "start cache",
                "start pop3",
                "start smtp",
                "stop smtp",
                "stop pop3",
                "stop cache",
            ],
            *log.lock().unwrap()
        );
    }

    #[test]
    fn failed_start_unwinds() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut lifecycle = Lifecycle::new();
        lifecycle.add(recorder("cache", false, &log));
        lifecycle.add(recorder("pop3", true, &log));
        lifecycle.add(recorder("smtp", false, &log));

        assert!(lifecycle.start_all().is_err());
        assert_eq!(
            vec!["start cache", "stop cache"],
            *log.lock().unwrap()
        );
    }
}
