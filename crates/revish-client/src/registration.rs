//! Client registration state machine
//!
//! The client walks a strictly sequential path:
//!
//! ```text
//! Disconnected -> Authenticating -> Connected -> NegotiatingAddress
//!     -> Listening -> Registering -> Active -> Unregistering -> Closed
//! ```
//!
//! Every failure before `Active` is fatal and ends in `Closed`. Once active,
//! the tunnel serves forwarded connections until shutdown, which always
//! attempts to unregister, then releases the listener, then closes the
//! connection, within a bounded time.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use revish_core::config::ClientConfig;
use revish_core::credentials::{CredentialError, CredentialProvider};
use revish_core::{HostIdentity, TunnelError};
use revish_protocol::{ProbeKind, RegistrationMessage};

use crate::state::Phase;
use crate::tunnel::{ControlConnection, DialError, Dialer, ForwardListener};

/// Knobs of the registration sequence
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    /// Server-side interface for the reverse listener
    pub remote_host: String,
    /// Server-side port for the reverse listener (0 = server chooses)
    pub remote_port: u32,
    /// Connection attempts before giving up on authentication
    pub max_auth_attempts: u32,
    /// Ceiling for graceful shutdown
    pub shutdown_timeout: Duration,
}

impl TunnelSettings {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            remote_host: config.remote_bind_host.clone(),
            remote_port: config.remote_port,
            max_auth_attempts: config.max_auth_attempts.max(1),
            shutdown_timeout: config.shutdown_timeout,
        }
    }
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

/// Drives a connection from dial to active registration
pub struct TunnelClient<D: Dialer> {
    dialer: D,
    credentials: Arc<dyn CredentialProvider>,
    identity: HostIdentity,
    settings: TunnelSettings,
    phase: Arc<watch::Sender<Phase>>,
}

impl<D: Dialer> TunnelClient<D> {
    pub fn new(
        dialer: D,
        credentials: Arc<dyn CredentialProvider>,
        identity: HostIdentity,
        settings: TunnelSettings,
    ) -> Self {
        let (phase, _) = watch::channel(Phase::Disconnected);
        Self {
            dialer,
            credentials,
            identity,
            settings,
            phase: Arc::new(phase),
        }
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Follow phase changes
    pub fn watch_phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Run the sequence up to `Active`
    pub async fn establish(self) -> Result<ActiveTunnel<D::Conn>, TunnelError> {
        let mut conn = self.authenticate().await?;

        let (mut listener, message) = match self.negotiate(&mut conn).await {
            Ok(negotiated) => negotiated,
            Err(e) => {
                self.abandon(conn, None).await;
                return Err(e);
            }
        };

        if let Err(e) = self.register(&conn, &message).await {
            self.abandon(conn, Some(&mut listener)).await;
            return Err(e);
        }

        set_phase(&self.phase, Phase::Active);
        tracing::info!(
            "Success: listening at home on {}",
            message.listening_address
        );

        Ok(ActiveTunnel {
            conn,
            listener,
            message,
            shutdown_timeout: self.settings.shutdown_timeout,
            phase: self.phase,
        })
    }

    /// Dial until the credentials are accepted or attempts run out
    async fn authenticate(&self) -> Result<D::Conn, TunnelError> {
        let max_attempts = self.settings.max_auth_attempts;
        let mut credentials = self.credentials.initial();

        for attempt in 1..=max_attempts {
            set_phase(&self.phase, Phase::Authenticating);

            match self.dialer.dial(&credentials).await {
                Ok(conn) => {
                    set_phase(&self.phase, Phase::Connected);
                    return Ok(conn);
                }
                Err(DialError::AuthRejected) => {
                    tracing::warn!(
                        "Authentication rejected (attempt {}/{})",
                        attempt,
                        max_attempts
                    );
                    if attempt == max_attempts {
                        break;
                    }
                    match self.prompt_password(&credentials.user).await {
                        Ok(password) => credentials.password = password,
                        Err(e) => {
                            tracing::warn!("{}; retrying with the same credentials", e);
                        }
                    }
                }
                Err(DialError::HostKeyRejected(reason)) => {
                    set_phase(&self.phase, Phase::Closed);
                    return Err(TunnelError::Authentication(reason));
                }
                Err(DialError::Other(e)) => {
                    set_phase(&self.phase, Phase::Closed);
                    return Err(TunnelError::Transport(format!("{:#}", e)));
                }
            }
        }

        set_phase(&self.phase, Phase::Closed);
        Err(TunnelError::Authentication(format!(
            "credentials for '{}' rejected {} times",
            credentials.user, max_attempts
        )))
    }

    /// Prompt off the async runtime; terminal prompts block
    async fn prompt_password(&self, user: &str) -> Result<String, CredentialError> {
        let provider = Arc::clone(&self.credentials);
        let user = user.to_string();
        tokio::task::spawn_blocking(move || provider.prompt_password(&user))
            .await
            .map_err(|e| CredentialError::Prompt(e.to_string()))?
    }

    /// Reserve a reverse listening address and confirm it with the server
    async fn negotiate(
        &self,
        conn: &mut D::Conn,
    ) -> Result<(<D::Conn as ControlConnection>::Listener, RegistrationMessage), TunnelError> {
        set_phase(&self.phase, Phase::NegotiatingAddress);

        let mut listener = conn
            .request_reverse_listen(&self.settings.remote_host, self.settings.remote_port)
            .await
            .map_err(|e| {
                TunnelError::Negotiation(format!(
                    "reverse listen on {}:{} failed: {:#}",
                    self.settings.remote_host, self.settings.remote_port, e
                ))
            })?;

        let address = listener.local_address().to_string();
        tracing::info!("Trying to listen on {}", address);

        let message = RegistrationMessage::new(
            self.identity.current_user.clone(),
            self.identity.hostname.clone(),
            address.clone(),
        );

        let kind = ProbeKind::RequestRemotePort;
        let verdict = match conn.open_probe(kind, &message).await {
            Ok(outcome) if outcome.is(kind.success_status()) => Ok(()),
            Ok(outcome) => Err(TunnelError::Negotiation(format!(
                "server did not confirm {}: {}",
                address, outcome
            ))),
            Err(e) => Err(TunnelError::Negotiation(e.to_string())),
        };

        if let Err(e) = verdict {
            if let Err(close_err) = listener.close().await {
                tracing::debug!("Failed to release {}: {:#}", address, close_err);
            }
            return Err(e);
        }

        set_phase(&self.phase, Phase::Listening);
        Ok((listener, message))
    }

    /// Announce the session to the directory
    async fn register(
        &self,
        conn: &D::Conn,
        message: &RegistrationMessage,
    ) -> Result<(), TunnelError> {
        set_phase(&self.phase, Phase::Registering);

        let kind = ProbeKind::RegisterSession;
        match conn.open_probe(kind, message).await {
            Ok(outcome) if outcome.is(kind.success_status()) => Ok(()),
            Ok(outcome) => Err(TunnelError::Registration(format!(
                "unexpected answer from server: {}",
                outcome
            ))),
            Err(e) => Err(TunnelError::Registration(e.to_string())),
        }
    }

    /// Release whatever was acquired after a fatal failure
    async fn abandon(
        &self,
        mut conn: D::Conn,
        listener: Option<&mut <D::Conn as ControlConnection>::Listener>,
    ) {
        if let Some(listener) = listener {
            if let Err(e) = listener.close().await {
                tracing::debug!("Failed to release listener: {:#}", e);
            }
        }
        if let Err(e) = conn.close().await {
            tracing::debug!("Failed to close connection: {:#}", e);
        }
        set_phase(&self.phase, Phase::Closed);
    }
}

/// A registered tunnel serving forwarded connections
pub struct ActiveTunnel<C: ControlConnection> {
    conn: C,
    listener: C::Listener,
    message: RegistrationMessage,
    shutdown_timeout: Duration,
    phase: Arc<watch::Sender<Phase>>,
}

impl<C: ControlConnection> ActiveTunnel<C> {
    /// Address operators reach this client at
    pub fn listening_address(&self) -> &str {
        &self.message.listening_address
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Serve forwarded connections until `shutdown` resolves, then tear down.
    ///
    /// Each connection is handed to `handler` on its own task. If the
    /// connection home is lost the tunnel tears down and reports a transport
    /// error.
    pub async fn serve<H, Fut, S>(mut self, handler: H, shutdown: S) -> Result<(), TunnelError>
    where
        H: Fn(<C::Listener as ForwardListener>::Stream) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let lost = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested");
                    break false;
                }

                stream = self.listener.accept() => {
                    match stream {
                        Some(stream) => {
                            tokio::spawn(handler(stream));
                        }
                        None => {
                            tracing::warn!("Reverse listener closed by the server");
                            break true;
                        }
                    }
                }
            }
        };

        self.shutdown().await?;
        if lost {
            return Err(TunnelError::Transport(
                "connection to the server was lost".to_string(),
            ));
        }
        Ok(())
    }

    /// Unregister, release the listener and close, within the shutdown ceiling
    pub async fn shutdown(mut self) -> Result<(), TunnelError> {
        let ceiling = self.shutdown_timeout;
        match tokio::time::timeout(ceiling, self.teardown()).await {
            Ok(()) => Ok(()),
            Err(_) => {
                set_phase(&self.phase, Phase::Closed);
                Err(TunnelError::ShutdownTimedOut(ceiling))
            }
        }
    }

    async fn teardown(&mut self) {
        set_phase(&self.phase, Phase::Unregistering);

        let kind = ProbeKind::UnregisterSession;
        match self.conn.open_probe(kind, &self.message).await {
            Ok(outcome) if outcome.is(kind.success_status()) => {
                tracing::info!("Unregistered {}", self.message.listening_address);
            }
            Ok(outcome) => {
                let e = TunnelError::Teardown(format!("unexpected answer: {}", outcome));
                tracing::warn!("{}", e);
            }
            Err(e) => {
                tracing::warn!("{}", TunnelError::Teardown(e.to_string()));
            }
        }

        if let Err(e) = self.listener.close().await {
            tracing::warn!("Failed to release reverse listener: {:#}", e);
        }
        if let Err(e) = self.conn.close().await {
            tracing::debug!("Failed to close connection: {:#}", e);
        }

        set_phase(&self.phase, Phase::Closed);
    }
}

fn set_phase(phase: &watch::Sender<Phase>, next: Phase) {
    let previous = phase.send_replace(next);
    if previous != next {
        tracing::debug!("Phase {} -> {}", previous, next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use revish_core::credentials::ServiceCredentials;
    use revish_protocol::{ProbeOutcome, ProbeStatus};
    use tokio::io::DuplexStream;

    use crate::tunnel::ProbeError;

    type Events = Arc<Mutex<Vec<String>>>;

    fn record(events: &Events, event: impl Into<String>) {
        events.lock().unwrap().push(event.into());
    }

    /// How the fake server answers one probe
    #[derive(Clone, Copy)]
    enum Answer {
        Status(ProbeStatus),
        Unsupported,
        Fail,
        Hang,
    }

    #[derive(Clone)]
    struct Script {
        port: Answer,
        register: Answer,
        unregister: Answer,
    }

    impl Default for Script {
        fn default() -> Self {
            Self {
                port: Answer::Status(ProbeStatus::Available),
                register: Answer::Status(ProbeStatus::Registered),
                unregister: Answer::Status(ProbeStatus::Unregistered),
            }
        }
    }

    struct FakeDialer {
        password: String,
        failure: Option<fn() -> DialError>,
        script: Script,
        events: Events,
        attempts: Arc<Mutex<Vec<String>>>,
    }

    impl FakeDialer {
        fn new(password: &str, events: &Events) -> Self {
            Self {
                password: password.to_string(),
                failure: None,
                script: Script::default(),
                events: Arc::clone(events),
                attempts: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl Dialer for FakeDialer {
        type Conn = FakeConnection;

        async fn dial(&self, credentials: &ServiceCredentials) -> Result<FakeConnection, DialError> {
            self.attempts.lock().unwrap().push(credentials.password.clone());
            if let Some(failure) = self.failure {
                return Err(failure());
            }
            if credentials.password != self.password {
                return Err(DialError::AuthRejected);
            }
            Ok(FakeConnection {
                script: self.script.clone(),
                events: Arc::clone(&self.events),
                incoming: None,
            })
        }
    }

    struct FakeConnection {
        script: Script,
        events: Events,
        incoming: Option<tokio::sync::mpsc::Sender<DuplexStream>>,
    }

    #[async_trait]
    impl ControlConnection for FakeConnection {
        type Listener = FakeListener;

        async fn request_reverse_listen(&mut self, host: &str, port: u32) -> anyhow::Result<FakeListener> {
            record(&self.events, format!("listen {}:{}", host, port));
            let (tx, rx) = tokio::sync::mpsc::channel(4);
            self.incoming = Some(tx);
            Ok(FakeListener {
                address: format!("{}:40000", host),
                incoming: rx,
                events: Arc::clone(&self.events),
                released: false,
            })
        }

        async fn open_probe(
            &self,
            kind: ProbeKind,
            message: &RegistrationMessage,
        ) -> Result<ProbeOutcome, ProbeError> {
            record(&self.events, format!("{} {}", kind, message.listening_address));
            let answer = match kind {
                ProbeKind::RequestRemotePort => self.script.port,
                ProbeKind::RegisterSession => self.script.register,
                ProbeKind::UnregisterSession => self.script.unregister,
            };
            match answer {
                Answer::Status(status) => Ok(ProbeOutcome::Rejected(status)),
                Answer::Unsupported => Ok(ProbeOutcome::Unsupported),
                Answer::Fail => Err(ProbeError::Transport("connection reset".to_string())),
                Answer::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }

        async fn close(&mut self) -> anyhow::Result<()> {
            record(&self.events, "connection closed");
            Ok(())
        }
    }

    struct FakeListener {
        address: String,
        incoming: tokio::sync::mpsc::Receiver<DuplexStream>,
        events: Events,
        released: bool,
    }

    #[async_trait]
    impl ForwardListener for FakeListener {
        type Stream = DuplexStream;

        fn local_address(&self) -> &str {
            &self.address
        }

        async fn accept(&mut self) -> Option<DuplexStream> {
            self.incoming.recv().await
        }

        async fn close(&mut self) -> anyhow::Result<()> {
            if !self.released {
                self.released = true;
                record(&self.events, "listener released");
            }
            Ok(())
        }
    }

    /// Prompts return the next scripted password
    struct ScriptedPrompt {
        initial: ServiceCredentials,
        answers: Mutex<VecDeque<Result<String, CredentialError>>>,
        prompts: Mutex<usize>,
    }

    impl ScriptedPrompt {
        fn new(initial: &str, answers: Vec<Result<String, CredentialError>>) -> Arc<Self> {
            Arc::new(Self {
                initial: ServiceCredentials::new("revish", initial),
                answers: Mutex::new(answers.into()),
                prompts: Mutex::new(0),
            })
        }

        fn prompts(&self) -> usize {
            *self.prompts.lock().unwrap()
        }
    }

    impl CredentialProvider for ScriptedPrompt {
        fn initial(&self) -> ServiceCredentials {
            self.initial.clone()
        }

        fn prompt_password(&self, _user: &str) -> Result<String, CredentialError> {
            *self.prompts.lock().unwrap() += 1;
            self.answers
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(CredentialError::NonInteractive))
        }
    }

    fn identity() -> HostIdentity {
        HostIdentity::new("alice", "alicebox")
    }

    fn settings() -> TunnelSettings {
        TunnelSettings {
            remote_host: "127.0.0.1".to_string(),
            remote_port: 0,
            max_auth_attempts: 3,
            shutdown_timeout: Duration::from_secs(30),
        }
    }

    fn connection_refused() -> DialError {
        DialError::Other(anyhow::anyhow!("connection refused"))
    }

    fn events() -> Events {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn recorded(events: &Events) -> Vec<String> {
        events.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_two_rejections_then_success_reaches_active() {
        let events = events();
        let dialer = FakeDialer::new("right", &events);
        let attempts = Arc::clone(&dialer.attempts);
        let prompt = ScriptedPrompt::new(
            "wrong-1",
            vec![Ok("wrong-2".to_string()), Ok("right".to_string())],
        );

        let client = TunnelClient::new(dialer, prompt.clone(), identity(), settings());
        let tunnel = client.establish().await.unwrap();

        assert_eq!(tunnel.phase(), Phase::Active);
        assert_eq!(tunnel.listening_address(), "127.0.0.1:40000");
        assert_eq!(*attempts.lock().unwrap(), vec!["wrong-1", "wrong-2", "right"]);
        assert_eq!(prompt.prompts(), 2);
        assert_eq!(
            recorded(&events),
            vec![
                "listen 127.0.0.1:0",
                "request-remote-port 127.0.0.1:40000",
                "register-session 127.0.0.1:40000",
            ]
        );
    }

    #[tokio::test]
    async fn test_exhausted_attempts_fail_authentication() {
        let events = events();
        let dialer = FakeDialer::new("right", &events);
        let attempts = Arc::clone(&dialer.attempts);
        let prompt = ScriptedPrompt::new(
            "wrong-1",
            vec![
                Ok("wrong-2".to_string()),
                Ok("wrong-3".to_string()),
                Ok("wrong-4".to_string()),
            ],
        );

        let client = TunnelClient::new(dialer, prompt.clone(), identity(), settings());
        let mut phases = client.watch_phase();
        let result = client.establish().await;

        assert!(matches!(result, Err(TunnelError::Authentication(_))));
        assert_eq!(attempts.lock().unwrap().len(), 3);
        // No prompt after the final rejection
        assert_eq!(prompt.prompts(), 2);
        assert_eq!(*phases.borrow_and_update(), Phase::Closed);
        assert!(recorded(&events).is_empty());
    }

    #[tokio::test]
    async fn test_failed_prompt_retries_same_credentials() {
        let events = events();
        let dialer = FakeDialer::new("right", &events);
        let attempts = Arc::clone(&dialer.attempts);
        let prompt = ScriptedPrompt::new(
            "wrong",
            vec![Err(CredentialError::Prompt("tty gone".to_string()))],
        );

        let client = TunnelClient::new(dialer, prompt, identity(), settings());
        let result = client.establish().await;

        assert!(matches!(result, Err(TunnelError::Authentication(_))));
        assert_eq!(*attempts.lock().unwrap(), vec!["wrong", "wrong", "wrong"]);
    }

    #[tokio::test]
    async fn test_other_dial_errors_do_not_retry() {
        let events = events();
        let mut dialer = FakeDialer::new("right", &events);
        dialer.failure = Some(connection_refused);
        let attempts = Arc::clone(&dialer.attempts);
        let prompt = ScriptedPrompt::new("right", vec![]);

        let client = TunnelClient::new(dialer, prompt.clone(), identity(), settings());
        let result = client.establish().await;

        assert!(matches!(result, Err(TunnelError::Transport(_))));
        assert_eq!(attempts.lock().unwrap().len(), 1);
        assert_eq!(prompt.prompts(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_port_probe_fails_negotiation() {
        let events = events();
        let mut dialer = FakeDialer::new("right", &events);
        dialer.script.port = Answer::Unsupported;

        let client = TunnelClient::new(dialer, ScriptedPrompt::new("right", vec![]), identity(), settings());
        let result = client.establish().await;

        assert!(matches!(result, Err(TunnelError::Negotiation(_))));
        let events = recorded(&events);
        assert!(!events.iter().any(|e| e.starts_with("register-session")));
        assert_eq!(events.last().map(String::as_str), Some("connection closed"));
    }

    #[tokio::test]
    async fn test_taken_port_fails_negotiation() {
        let events = events();
        let mut dialer = FakeDialer::new("right", &events);
        dialer.script.port = Answer::Status(ProbeStatus::Taken);

        let client = TunnelClient::new(dialer, ScriptedPrompt::new("right", vec![]), identity(), settings());
        let result = client.establish().await;

        assert!(matches!(result, Err(TunnelError::Negotiation(_))));
        assert!(recorded(&events).contains(&"listener released".to_string()));
    }

    #[tokio::test]
    async fn test_unexpected_register_answer_fails_registration() {
        for answer in [
            Answer::Status(ProbeStatus::Malformed),
            Answer::Status(ProbeStatus::Unregistered),
            Answer::Unsupported,
            Answer::Fail,
        ] {
            let events = events();
            let mut dialer = FakeDialer::new("right", &events);
            dialer.script.register = answer;

            let client =
                TunnelClient::new(dialer, ScriptedPrompt::new("right", vec![]), identity(), settings());
            let result = client.establish().await;

            assert!(matches!(result, Err(TunnelError::Registration(_))));
            assert_eq!(
                recorded(&events).last().map(String::as_str),
                Some("connection closed")
            );
        }
    }

    #[tokio::test]
    async fn test_shutdown_unregisters_before_releasing_listener() {
        for unregister in [
            Answer::Status(ProbeStatus::Unregistered),
            Answer::Status(ProbeStatus::Malformed),
            Answer::Fail,
        ] {
            let events = events();
            let mut dialer = FakeDialer::new("right", &events);
            dialer.script.unregister = unregister;

            let client =
                TunnelClient::new(dialer, ScriptedPrompt::new("right", vec![]), identity(), settings());
            let tunnel = client.establish().await.unwrap();
            events.lock().unwrap().clear();

            tunnel.serve(|_stream| async {}, async {}).await.unwrap();

            assert_eq!(
                recorded(&events),
                vec![
                    "unregister-session 127.0.0.1:40000",
                    "listener released",
                    "connection closed",
                ]
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_ceiling() {
        let events = events();
        let mut dialer = FakeDialer::new("right", &events);
        dialer.script.unregister = Answer::Hang;

        let mut settings = settings();
        settings.shutdown_timeout = Duration::from_secs(30);
        let client = TunnelClient::new(dialer, ScriptedPrompt::new("right", vec![]), identity(), settings);
        let tunnel = client.establish().await.unwrap();

        let result = tunnel.shutdown().await;
        assert!(matches!(
            result,
            Err(TunnelError::ShutdownTimedOut(d)) if d == Duration::from_secs(30)
        ));
    }

    #[tokio::test]
    async fn test_serve_hands_streams_to_handler() {
        let events = events();
        let dialer = FakeDialer::new("right", &events);
        let client = TunnelClient::new(dialer, ScriptedPrompt::new("right", vec![]), identity(), settings());
        let tunnel = client.establish().await.unwrap();

        // Reach the fake connection's sender to simulate a forwarded connection
        let sender = tunnel.conn.incoming.clone().unwrap();
        let (near, _far) = tokio::io::duplex(16);
        sender.send(near).await.unwrap();

        let (served_tx, served_rx) = tokio::sync::oneshot::channel::<()>();
        let served_tx = Arc::new(Mutex::new(Some(served_tx)));

        let handler = move |_stream: DuplexStream| {
            let served_tx = Arc::clone(&served_tx);
            async move {
                if let Some(tx) = served_tx.lock().unwrap().take() {
                    let _ = tx.send(());
                }
            }
        };

        tunnel
            .serve(handler, async move {
                let _ = served_rx.await;
            })
            .await
            .unwrap();
    }
}
