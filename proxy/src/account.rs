//! One bouncer account: its attached clients, persistent channel state and
//! the lifecycle of its upstream connection.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::channel::mpsc;
use irc::proto::Message;
use thiserror::Error;

use crate::auth::Authorization;
use crate::backbuffer::Backbuffer;
use crate::client::{self, Client};
use crate::event::Event;
use crate::handler::{self, Flow, Handler};
use crate::{config, parser, reply, server};

pub const RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Channel state that outlives a single upstream connection.
#[derive(Debug, Clone)]
pub struct ChannelState {
    pub name: String,
    pub backbuffer: Backbuffer,
}

/// State shared by every connection of an account.
pub struct Session {
    pub name: String,
    pub config: Arc<config::Account>,
    /// Host of the bouncer's pseudo users
    pub server_name: String,
    pub clients: Vec<Client>,
    /// Keyed by lowercased channel name
    pub channels: BTreeMap<String, ChannelState>,
    pub private: Backbuffer,
    pub authorization: Arc<dyn Authorization>,
}

impl Session {
    pub fn new(
        name: impl Into<String>,
        config: Arc<config::Account>,
        server_name: impl Into<String>,
        authorization: Arc<dyn Authorization>,
    ) -> Self {
        Self {
            name: name.into(),
            private: Backbuffer::new(config.private_backbuffer),
            config,
            server_name: server_name.into(),
            clients: vec![],
            channels: BTreeMap::new(),
            authorization,
        }
    }

    pub fn client(&self, id: client::Id) -> Option<&Client> {
        self.clients.iter().find(|client| client.id() == id)
    }

    pub fn client_mut(&mut self, id: client::Id) -> Option<&mut Client> {
        self.clients.iter_mut().find(|client| client.id() == id)
    }

    pub fn channel_state(&mut self, name: &str) -> &mut ChannelState {
        let capacity = self.config.backbuffer;

        self.channels
            .entry(name.to_lowercase())
            .or_insert_with(|| ChannelState {
                name: name.to_string(),
                backbuffer: Backbuffer::new(capacity),
            })
    }

    /// A notice from the bouncer to every attached client.
    pub fn announce(&self, text: &str) {
        for client in &self.clients {
            client.send(reply::announce(&self.server_name, client.nickname(), text));
        }
    }
}

/// What the socket layer needs to open an upstream connection.
#[derive(Debug)]
pub struct Connect {
    pub account: String,
    pub handler: handler::Id,
    pub target: server::Target,
    pub accept_invalid_certs: bool,
    pub root_cert_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
    /// Lines to write upstream
    pub outgoing: mpsc::UnboundedReceiver<Message>,
}

pub struct Account {
    session: Session,
    handler: Option<Handler>,
    next_handler: u64,
    server_index: usize,
    reconnect_at: Option<Instant>,
    disconnect_wanted: bool,
    skip_reconnect: bool,
    suspended: Option<String>,
}

impl Account {
    pub fn new(
        name: impl Into<String>,
        config: Arc<config::Account>,
        server_name: impl Into<String>,
        authorization: Arc<dyn Authorization>,
    ) -> Self {
        let suspended = config.suspended.clone();

        Self {
            session: Session::new(name, config, server_name, authorization),
            handler: None,
            next_handler: 0,
            server_index: 0,
            reconnect_at: suspended.is_none().then(Instant::now),
            disconnect_wanted: false,
            skip_reconnect: false,
            suspended,
        }
    }

    pub fn name(&self) -> &str {
        &self.session.name
    }

    pub fn config(&self) -> &Arc<config::Account> {
        &self.session.config
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn is_connected(&self) -> bool {
        self.handler.as_ref().is_some_and(Handler::is_ready)
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.is_some()
    }

    pub fn reconnect_at(&self) -> Option<Instant> {
        self.reconnect_at
    }

    pub fn attach(&mut self, mut client: Client) {
        let id = client.id();
        let first = self.session.clients.is_empty();

        log::info!("[{}] {id} attached", self.session.name);

        let ready = self.handler.as_ref().is_some_and(Handler::is_ready);
        client.set_force_requeue(!ready);
        self.session.clients.push(client);

        let Some(handler) = &mut self.handler else {
            if let Some(client) = self.session.client(id) {
                client.send(reply::announce(
                    &self.session.server_name,
                    client.nickname(),
                    "Not connected to a server",
                ));
            }
            return;
        };

        handler.user_connected(&mut self.session, id);

        if first && ready {
            for line in &self.session.config.perform.attach {
                if let Some(message) = parser::raw_line(line) {
                    handler.send(message);
                }
            }
        }
    }

    pub fn detach(&mut self, id: client::Id) {
        let Some(position) = self
            .session
            .clients
            .iter()
            .position(|client| client.id() == id)
        else {
            return;
        };

        self.session.clients.remove(position);

        log::info!("[{}] {id} detached", self.session.name);

        if let Some(handler) = &mut self.handler {
            handler.user_disconnected(id);

            if self.session.clients.is_empty() && handler.is_ready() {
                for line in &self.session.config.perform.detach {
                    if let Some(message) = parser::raw_line(line) {
                        handler.send(message);
                    }
                }
            }
        }
    }

    pub fn client_command(&mut self, id: client::Id, message: Message) {
        let Some(client) = self.session.client(id) else {
            return;
        };

        if message.command.command() == "QUIT" {
            client.close("Client quit");
            return;
        }

        match &mut self.handler {
            Some(handler) => handler.process_client_command(&mut self.session, id, message, 0),
            None => client.send(reply::announce(
                &self.session.server_name,
                client.nickname(),
                "Not connected to a server, command dropped",
            )),
        }
    }

    /// Starts a connection attempt on the next server in rotation.
    pub fn connect(&mut self) -> Result<Connect, Error> {
        if let Some(reason) = &self.suspended {
            return Err(Error::Suspended(reason.clone()));
        }

        let index = self.server_index;
        let target = server::select(&self.session.config.servers, index)?;

        self.server_index = index.wrapping_add(1);
        self.next_handler += 1;
        self.reconnect_at = None;
        self.disconnect_wanted = false;

        let id = handler::Id::from(self.next_handler);
        let (handler, outgoing) = Handler::new(id, index, &self.session, target.clone());

        log::info!("[{}] connecting to {target} ({id})", self.session.name);

        // Held until the new connection welcomes them
        for client in &mut self.session.clients {
            client.set_force_requeue(true);
        }

        self.handler = Some(handler);

        Ok(Connect {
            account: self.session.name.clone(),
            handler: id,
            target,
            accept_invalid_certs: self.session.config.dangerously_accept_invalid_certs,
            root_cert_path: self.session.config.root_cert_path.clone(),
            client_cert_path: self.session.config.client_cert_path.clone(),
            client_key_path: self.session.config.client_key_path.clone(),
            outgoing,
        })
    }

    /// Feeds an event of the connection `id`. Events of replaced
    /// connections are ignored.
    pub fn upstream(&mut self, id: handler::Id, event: Event) {
        let Some(handler) = self.handler.as_mut().filter(|handler| handler.id() == id) else {
            log::trace!("[{}] ignoring event of stale {id}", self.session.name);
            return;
        };

        if let Flow::Closed(reason) = handler.dispatch(&mut self.session, event) {
            self.upstream_closed(&reason);
        }
    }

    /// Tears down the current connection. Returns false if there was none.
    pub fn upstream_closed(&mut self, reason: &str) -> bool {
        let Some(handler) = self.handler.take() else {
            return false;
        };

        log::warn!(
            "[{}] disconnected from {}: {reason}",
            self.session.name,
            handler.target()
        );

        if self.session.config.user_disconnect {
            for client in self.session.clients.drain(..) {
                client.close(format!("Disconnected from server: {reason}"));
            }
        } else {
            let ids = self.session.clients.iter().map(Client::id).collect::<Vec<_>>();
            for id in ids {
                handler.cleanup_user(&self.session, id);
            }
            for client in &mut self.session.clients {
                client.set_welcomed(false);
            }
            self.session
                .announce(&format!("Disconnected from server: {reason}"));
        }

        if self.skip_reconnect {
            self.skip_reconnect = false;
            log::info!("[{}] reconnect skipped", self.session.name);
        } else if self.disconnect_wanted
            || self.suspended.is_some()
            || !self.session.config.reconnect
        {
            log::debug!("[{}] not reconnecting", self.session.name);
        } else {
            self.reconnect_at = Some(Instant::now() + RECONNECT_DELAY);
            log::info!(
                "[{}] reconnecting in {}s",
                self.session.name,
                RECONNECT_DELAY.as_secs()
            );
        }

        true
    }

    /// Drives timers. Returns a connection to open when one is due.
    pub fn tick(&mut self, now: Instant) -> Option<Connect> {
        if let Some(handler) = &mut self.handler {
            handler.tick(&mut self.session, now);
            return None;
        }

        if self.reconnect_at.is_none_or(|at| now < at) {
            return None;
        }

        match self.connect() {
            Ok(connect) => Some(connect),
            Err(error) => {
                // Not retried until configuration changes
                log::error!("[{}] {error}", self.session.name);
                self.session.announce(&format!("Unable to connect: {error}"));
                self.reconnect_at = None;
                None
            }
        }
    }

    /// Quits upstream and stays disconnected.
    pub fn disconnect(&mut self, reason: &str) {
        self.disconnect_wanted = true;
        self.reconnect_at = None;

        if let Some(handler) = &self.handler {
            handler.quit(reason);
        }

        self.upstream_closed(reason);
    }

    /// Connects now, replacing a current connection.
    pub fn jump(&mut self) {
        if self.suspended.is_some() {
            return;
        }

        if let Some(handler) = &self.handler {
            handler.quit("Reconnecting");
        }

        self.skip_reconnect = false;
        self.disconnect_wanted = false;
        self.upstream_closed("Reconnecting");
        self.reconnect_at = Some(Instant::now());
    }

    /// The next closure of the connection does not arm a reconnect.
    pub fn disable_reconnect(&mut self) {
        self.skip_reconnect = true;
    }

    pub fn suspend(&mut self, reason: &str) {
        log::info!("[{}] suspended: {reason}", self.session.name);

        self.suspended = Some(reason.to_string());

        for client in self.session.clients.drain(..) {
            client.close(format!("Account suspended: {reason}"));
        }

        self.disconnect(&format!("Account suspended: {reason}"));
    }

    /// Closes everything, the account is about to be dropped.
    pub fn delete(&mut self) {
        log::info!("[{}] deleted", self.session.name);

        for client in self.session.clients.drain(..) {
            client.close("Account deleted");
        }

        self.disconnect("Account deleted");
        self.session.channels.clear();
        self.session.private.clear();
    }

    pub fn announce(&self, text: &str) {
        self.session.announce(text);
    }

    /// Applies changed settings to the running account.
    pub fn reconfigure(
        &mut self,
        config: Arc<config::Account>,
        authorization: Arc<dyn Authorization>,
    ) {
        for state in self.session.channels.values_mut() {
            state.backbuffer.set_capacity(config.backbuffer);
        }
        self.session.private.set_capacity(config.private_backbuffer);

        for client in &mut self.session.clients {
            let subclient = config.subclient(client.subclient());
            client.set_autoburst(subclient.autoburst);
        }

        let suspended = config.suspended.clone();

        self.session.config = config;
        self.session.authorization = authorization;

        match (suspended, self.suspended.is_some()) {
            (Some(reason), false) => self.suspend(&reason),
            (None, true) => {
                log::info!("[{}] unsuspended", self.session.name);

                self.suspended = None;
                self.reconnect_at = Some(Instant::now());
            }
            _ => {
                // Servers may have been fixed after a terminal failure
                if self.handler.is_none() && self.reconnect_at.is_none() && !self.disconnect_wanted
                {
                    self.reconnect_at = self.suspended.is_none().then(Instant::now);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error(transparent)]
    Server(#[from] server::Error),
    #[error("account suspended: {0}")]
    Suspended(String),
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::auth::Unrestricted;
    use crate::client::Capability;
    use crate::client::test::{client, sent};
    use crate::parser::test::{account, drain, encode, line};

    fn new_account(config: Arc<config::Account>) -> Account {
        Account::new("alice", config, "tether.test", Arc::new(Unrestricted))
    }

    fn welcome(account: &mut Account, id: handler::Id) {
        for raw in [
            ":irc.test 001 alice :Welcome alice!al@host",
            ":irc.test 002 alice :Your host is irc.test",
            ":irc.test 376 alice :End of /MOTD command.",
        ] {
            account.upstream(id, Event::DataIn(line(raw)));
        }
    }

    #[test]
    fn connects_on_first_tick() {
        let mut account = new_account(account());

        let connect = account.tick(Instant::now()).unwrap();
        let mut outgoing = connect.outgoing;

        assert_eq!(connect.target.host, "irc.test");
        assert_eq!(
            drain(&mut outgoing),
            vec![
                "CAP LS 302",
                "PASS secret",
                "NICK alice",
                "USER alice 0 * :Alice Liddell"
            ]
        );

        // connecting, nothing else to do
        assert!(account.tick(Instant::now()).is_none());
    }

    #[test]
    fn welcome_depends_on_readiness() {
        let mut account = new_account(account());
        let connect = account.tick(Instant::now()).unwrap();

        let (early, mut early_receiver) = client(1, true, &[]);
        account.attach(early);
        assert!(sent(&mut early_receiver).is_empty());

        welcome(&mut account, connect.handler);

        let welcomed = sent(&mut early_receiver)
            .into_iter()
            .filter(|message| message.command.numeric() == Some(1))
            .count();
        assert_eq!(welcomed, 1);

        let (late, mut late_receiver) = client(2, true, &[]);
        account.attach(late);

        let messages = sent(&mut late_receiver);
        assert_eq!(messages[0].command.numeric(), Some(1));
        assert_eq!(
            messages
                .iter()
                .filter(|message| message.command.numeric() == Some(1))
                .count(),
            1
        );
    }

    #[test]
    fn queued_commands_run_once_ready() {
        let mut account = new_account(account());
        let connect = account.tick(Instant::now()).unwrap();
        let mut outgoing = connect.outgoing;

        let (early, _receiver) = client(1, true, &[]);
        account.attach(early);
        account.client_command(client::Id::from(1), line("JOIN #rust"));

        welcome(&mut account, connect.handler);
        drain(&mut outgoing);

        account.tick(Instant::now());
        assert_eq!(drain(&mut outgoing), vec!["JOIN #rust"]);
    }

    #[test]
    fn closing_twice_arms_once() {
        let mut account = new_account(account());
        let connect = account.tick(Instant::now()).unwrap();
        welcome(&mut account, connect.handler);

        let (attached, mut receiver) = client(1, true, &[]);
        account.attach(attached);
        sent(&mut receiver);

        account.upstream(connect.handler, Event::SocketClosed(Some("reset".into())));
        let armed = account.reconnect_at();
        assert!(armed.is_some());

        assert!(!account.upstream_closed("again"));
        account.upstream(connect.handler, Event::SocketClosed(None));

        assert_eq!(account.reconnect_at(), armed);
        assert_eq!(
            sent(&mut receiver)
                .into_iter()
                .map(encode)
                .collect::<Vec<_>>(),
            vec![":*tether!tether@tether.test NOTICE alice :Disconnected from server: reset"]
        );
    }

    #[test]
    fn commands_wait_for_the_new_connection() {
        let mut account = new_account(account());
        let connect = account.tick(Instant::now()).unwrap();
        welcome(&mut account, connect.handler);

        let (attached, mut receiver) = client(1, true, &[]);
        account.attach(attached);
        sent(&mut receiver);

        account.upstream(connect.handler, Event::SocketClosed(Some("reset".into())));

        let reconnect = account.tick(Instant::now() + RECONNECT_DELAY * 2).unwrap();
        let mut outgoing = reconnect.outgoing;
        drain(&mut outgoing);

        account.client_command(client::Id::from(1), line("PRIVMSG bob :still there?"));
        assert!(drain(&mut outgoing).is_empty());
        assert!(account.session().client(client::Id::from(1)).unwrap().is_force_requeue());

        welcome(&mut account, reconnect.handler);
        drain(&mut outgoing);

        account.tick(Instant::now());
        assert_eq!(drain(&mut outgoing), vec!["PRIVMSG bob :still there?"]);
    }

    #[test]
    fn reconnect_with_joined_channel() {
        let mut account = new_account(account());
        let connect = account.tick(Instant::now()).unwrap();
        welcome(&mut account, connect.handler);

        let (attached, mut receiver) = client(1, true, &[]);
        account.attach(attached);

        for raw in [
            ":alice!al@host JOIN #rust",
            ":irc.test 353 alice = #rust :@alice bob",
            ":irc.test 366 alice #rust :End of /NAMES list.",
        ] {
            account.upstream(connect.handler, Event::DataIn(line(raw)));
        }
        sent(&mut receiver);

        account.upstream(connect.handler, Event::SocketClosed(Some("reset".into())));
        assert!(!account.upstream_closed("again"));
        account.upstream(connect.handler, Event::SocketClosed(None));

        assert_eq!(
            sent(&mut receiver)
                .into_iter()
                .map(encode)
                .collect::<Vec<_>>(),
            vec![
                ":irc.test KICK #rust alice :Upstream connection lost",
                ":*tether!tether@tether.test NOTICE alice :Disconnected from server: reset",
            ]
        );

        let reconnect = account.tick(Instant::now() + RECONNECT_DELAY * 2).unwrap();
        let mut outgoing = reconnect.outgoing;
        welcome(&mut account, reconnect.handler);

        assert!(drain(&mut outgoing).contains(&"JOIN #rust".to_string()));

        let welcomed = sent(&mut receiver)
            .into_iter()
            .filter(|message| message.command.numeric() == Some(1))
            .count();
        assert_eq!(welcomed, 1);
        assert!(!account.session().client(client::Id::from(1)).unwrap().is_force_requeue());
    }

    #[test]
    fn reconnects_after_delay() {
        let mut account = new_account(account());
        let connect = account.tick(Instant::now()).unwrap();

        account.upstream(connect.handler, Event::ConnectError("refused".into()));

        let now = Instant::now();
        assert!(account.tick(now).is_none());

        let connect = account.tick(now + RECONNECT_DELAY * 2).unwrap();
        assert_eq!(connect.handler, handler::Id::from(2));
    }

    #[test]
    fn stale_events_are_ignored() {
        let mut account = new_account(account());
        let first = account.tick(Instant::now()).unwrap();
        account.jump();
        let second = account.tick(Instant::now()).unwrap();

        account.upstream(first.handler, Event::SocketClosed(None));

        assert!(account.reconnect_at().is_none());
        assert_ne!(first.handler, second.handler);
    }

    #[test]
    fn disconnect_stays_disconnected() {
        let mut account = new_account(account());
        let connect = account.tick(Instant::now()).unwrap();
        let mut outgoing = connect.outgoing;
        drain(&mut outgoing);

        account.disconnect("bye");

        assert_eq!(drain(&mut outgoing), vec!["QUIT bye"]);
        assert!(account.reconnect_at().is_none());
        assert!(account.tick(Instant::now() + RECONNECT_DELAY * 2).is_none());
    }

    #[test]
    fn disabled_reconnect_is_consumed() {
        let mut account = new_account(account());
        let connect = account.tick(Instant::now()).unwrap();

        account.disable_reconnect();
        account.upstream(connect.handler, Event::SocketClosed(None));
        assert!(account.reconnect_at().is_none());

        account.jump();
        let connect = account.tick(Instant::now()).unwrap();
        account.upstream(connect.handler, Event::SocketClosed(None));
        assert!(account.reconnect_at().is_some());
    }

    #[test]
    fn missing_servers_are_terminal() {
        let mut account = new_account(Arc::new(config::Account {
            servers: vec![],
            ..(*account()).clone()
        }));

        assert!(account.tick(Instant::now()).is_none());
        assert!(account.reconnect_at().is_none());
    }

    #[test]
    fn user_disconnect_closes_clients() {
        let mut account = new_account(Arc::new(config::Account {
            user_disconnect: true,
            ..(*account()).clone()
        }));
        let connect = account.tick(Instant::now()).unwrap();
        welcome(&mut account, connect.handler);

        let (attached, mut receiver) = client(1, true, &[Capability::ServerTime]);
        account.attach(attached);
        sent(&mut receiver);

        account.upstream(connect.handler, Event::SocketClosed(Some("reset".into())));

        assert!(account.session().clients.is_empty());
        let mut closed = false;
        while let Ok(Some(output)) = receiver.try_next() {
            closed |= matches!(output, client::Output::Close(_));
        }
        assert!(closed);
    }

    #[test]
    fn suspended_accounts_never_connect() {
        let mut account = new_account(Arc::new(config::Account {
            suspended: Some("spamming".into()),
            ..(*account()).clone()
        }));

        assert!(account.tick(Instant::now()).is_none());
        assert!(matches!(account.connect(), Err(Error::Suspended(_))));

        account.reconfigure(crate::parser::test::account(), Arc::new(Unrestricted));
        assert!(account.tick(Instant::now()).is_some());
    }
}
