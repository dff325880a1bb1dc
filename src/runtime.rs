use std::collections::BTreeMap;
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures::channel::mpsc;
use futures::{StreamExt, stream};
use irc::proto::Message;
use proxy::client::{self, Client};
use proxy::config::{self, Config};
use proxy::stream::Update;
use proxy::{Account, Authorization, stream as upstream};
use tokio::time;

use crate::authorization::Whitelist;

const TICK: Duration = Duration::from_secs(1);

/// Sent to an account task.
#[derive(Debug)]
pub enum Input {
    Attach(Client),
    Detach(client::Id),
    Command(client::Id, Message),
    Control(client::Id, Control),
    Announce(String),
    Reconfigure(Arc<config::Account>),
    Delete,
}

/// `TETHER` commands of an attached client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    Connect,
    Disconnect(Option<String>),
    NoReconnect,
    Announce(String),
    Help,
    Unknown(String),
}

impl Control {
    pub fn parse(parameters: &[String]) -> Self {
        let Some(verb) = parameters.first() else {
            return Control::Help;
        };

        let rest = (parameters.len() > 1).then(|| parameters[1..].join(" "));

        match verb.to_uppercase().as_str() {
            "CONNECT" | "JUMP" => Control::Connect,
            "DISCONNECT" => Control::Disconnect(rest),
            "NORECONNECT" => Control::NoReconnect,
            "ANNOUNCE" => match rest {
                Some(text) => Control::Announce(text),
                None => Control::Help,
            },
            "HELP" => Control::Help,
            other => Control::Unknown(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Handle {
    sender: mpsc::UnboundedSender<Input>,
}

impl Handle {
    /// Best effort, a stopped account drops the input.
    pub fn send(&self, input: Input) {
        if self.sender.unbounded_send(input).is_err() {
            log::debug!("account task is gone, input dropped");
        }
    }
}

/// Running accounts, shared with the listener.
#[derive(Debug)]
pub struct Registry {
    config: RwLock<Arc<Config>>,
    accounts: RwLock<BTreeMap<String, Handle>>,
    next_client: AtomicU64,
}

impl Registry {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            config: RwLock::new(Arc::new(config)),
            accounts: RwLock::new(BTreeMap::new()),
            next_client: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> Arc<Config> {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn server_name(&self) -> String {
        self.config().listen.name.clone()
    }

    pub fn account(&self, name: &str) -> Option<Handle> {
        self.accounts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&config::normalize_username(name))
            .cloned()
    }

    pub fn next_client_id(&self) -> client::Id {
        client::Id::from(self.next_client.fetch_add(1, Ordering::Relaxed))
    }

    /// A notice to every client of every account.
    pub fn broadcast(&self, text: &str) {
        for handle in self
            .accounts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
        {
            handle.send(Input::Announce(text.to_string()));
        }
    }

    /// Starts the configured accounts.
    pub fn start(self: &Arc<Self>) {
        let config = self.config();

        for (name, account) in &config.accounts {
            self.spawn(name, account.clone(), &config.listen.name);
        }
    }

    /// Applies a reloaded configuration.
    pub fn reload(self: &Arc<Self>, config: Config) {
        let config = Arc::new(config);
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config.clone();

        let running = self
            .accounts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for (name, handle) in &running {
            match config.accounts.get(name) {
                Some(account) => handle.send(Input::Reconfigure(account.clone())),
                None => {
                    log::info!("[{name}] removed from configuration");

                    handle.send(Input::Delete);
                    self.accounts
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(name);
                }
            }
        }

        for (name, account) in &config.accounts {
            if !running.contains_key(name) {
                log::info!("[{name}] added to configuration");

                self.spawn(name, account.clone(), &config.listen.name);
            }
        }
    }

    fn spawn(self: &Arc<Self>, name: &str, config: Arc<config::Account>, server_name: &str) {
        let (sender, inputs) = mpsc::unbounded();

        let account = Account::new(
            name,
            config.clone(),
            server_name,
            Arc::new(Whitelist::new(&config)),
        );

        self.accounts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Handle { sender });

        tokio::spawn(run(account, inputs, self.clone()));
    }
}

enum Next {
    Input(Input),
    Upstream(Update),
    Tick,
    Stopped,
}

/// Owns one account. Every change to it happens on this task.
async fn run(mut account: Account, inputs: mpsc::UnboundedReceiver<Input>, registry: Arc<Registry>) {
    let (updates_sender, updates) = mpsc::unbounded::<Update>();

    let ticker = stream::unfold(time::interval(TICK), |mut interval| async move {
        interval.tick().await;
        Some((Next::Tick, interval))
    });

    let mut events = pin!(stream::select(
        stream::select(
            inputs
                .map(Next::Input)
                .chain(stream::once(async { Next::Stopped })),
            updates.map(Next::Upstream),
        ),
        ticker,
    ));

    log::debug!("[{}] account task started", account.name());

    while let Some(next) = events.next().await {
        match next {
            Next::Input(Input::Attach(client)) => account.attach(client),
            Next::Input(Input::Detach(id)) => account.detach(id),
            Next::Input(Input::Command(id, message)) => account.client_command(id, message),
            Next::Input(Input::Control(id, control)) => {
                self::control(&mut account, &registry, id, control);
            }
            Next::Input(Input::Announce(text)) => account.announce(&text),
            Next::Input(Input::Reconfigure(config)) => {
                let authorization: Arc<dyn Authorization> = Arc::new(Whitelist::new(&config));
                account.reconfigure(config, authorization);
            }
            Next::Input(Input::Delete) | Next::Stopped => {
                account.delete();
                break;
            }
            Next::Upstream(Update { handler, event, .. }) => account.upstream(handler, event),
            Next::Tick => {
                if let Some(connect) = account.tick(std::time::Instant::now()) {
                    tokio::spawn(upstream::run(connect, updates_sender.clone()));
                }
            }
        }
    }

    log::debug!("[{}] account task stopped", account.name());
}

fn control(account: &mut Account, registry: &Registry, id: client::Id, control: Control) {
    let reply = |text: &str| {
        if let Some(client) = account.session().client(id) {
            client.send(proxy::reply::announce(
                &account.session().server_name,
                client.nickname(),
                text,
            ));
        }
    };

    match control {
        Control::Connect => {
            reply("Connecting");
            account.jump();
        }
        Control::Disconnect(reason) => {
            account.disconnect(reason.as_deref().unwrap_or("Disconnected by user"));
        }
        Control::NoReconnect => {
            reply("The next disconnect will not reconnect");
            account.disable_reconnect();
        }
        Control::Announce(text) => {
            if account.config().admin {
                registry.broadcast(&text);
            } else {
                reply("Permission denied");
            }
        }
        Control::Help => {
            for line in [
                "TETHER CONNECT: connect now, replacing the current connection",
                "TETHER DISCONNECT [reason]: disconnect and stay disconnected",
                "TETHER NORECONNECT: do not reconnect after the next disconnect",
                "TETHER ANNOUNCE <text>: notice to every client (admins only)",
            ] {
                reply(line);
            }
        }
        Control::Unknown(verb) => reply(&format!("Unknown command {verb}, try TETHER HELP")),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn params(line: &str) -> Vec<String> {
        line.split(' ').map(String::from).collect()
    }

    #[test]
    fn control_commands() {
        assert_eq!(Control::parse(&[]), Control::Help);
        assert_eq!(Control::parse(&params("connect")), Control::Connect);
        assert_eq!(
            Control::parse(&params("DISCONNECT going away")),
            Control::Disconnect(Some("going away".into()))
        );
        assert_eq!(Control::parse(&params("disconnect")), Control::Disconnect(None));
        assert_eq!(
            Control::parse(&params("ANNOUNCE maintenance at noon")),
            Control::Announce("maintenance at noon".into())
        );
        assert_eq!(Control::parse(&params("announce")), Control::Help);
        assert_eq!(
            Control::parse(&params("frobnicate")),
            Control::Unknown("FROBNICATE".into())
        );
    }

    #[test]
    fn client_ids_are_unique() {
        let registry = Registry::new(Config::default());

        let first = registry.next_client_id();
        let second = registry.next_client_id();

        assert_ne!(first, second);
    }
}
