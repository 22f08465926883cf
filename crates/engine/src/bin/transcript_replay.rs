use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

use parley::{
    ChatSession, EngineSettings, ReactionOutcome, ReconcileOutcome, RecordingNavigator,
    RecordingSidebar, ScrollAnchor, SentinelDecision, SessionDeps, SessionError, SettingsStore,
    StreamStatus, Viewport, ViewportMetrics,
};
use parley_protocol::{ConversationId, Message, MessageId, Reaction};
use parley_storage::{HistoryStore, MemoryStore, PageRequest, SqliteStore, StorageError};
use parley_transport::{ScriptedTransport, TurnScript};

const SEEDED_MESSAGE_COUNT: usize = 40;
const REPLAY_ROW_HEIGHT_PX: f32 = 48.0;
const REPLAY_VIEWPORT_HEIGHT_PX: f32 = 720.0;

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
    db_path: Option<String>,
    config_path: Option<String>,
}

/// What every scenario runs against.
struct Replay {
    db_path: Option<String>,
    settings: Arc<EngineSettings>,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    Paginate,
    Race,
    Reactions,
    Turn,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "paginate" => Some(Self::Paginate),
            "race" => Some(Self::Race),
            "reactions" => Some(Self::Reactions),
            "turn" => Some(Self::Turn),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Paginate => "paginate",
            Self::Race => "race",
            Self::Reactions => "reactions",
            Self::Turn => "turn",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("missing required --scenario argument"))]
    MissingScenario { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown scenario '{raw}'"))]
    UnknownScenario { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("history store failed: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("session call failed: {source}"))]
    Session {
        stage: &'static str,
        source: SessionError,
    },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run().await {
        println!("runner_ok=false");
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;
    println!("scenario={}", args.scenario.name());
    if let Some(db_path) = args.db_path.as_deref() {
        println!("db_path={db_path}");
    }

    let settings_store = match args.config_path {
        Some(path) => SettingsStore::new(PathBuf::from(path)),
        None => SettingsStore::load(),
    };
    let settings = settings_store.settings();
    println!("settings_path={}", settings_store.config_path().display());
    println!("settings_initial_page_size={}", settings.initial_page_size);
    println!("settings_older_page_size={}", settings.older_page_size);

    let replay = Replay {
        db_path: args.db_path,
        settings,
    };
    match args.scenario {
        Scenario::Paginate => run_paginate(&replay).await?,
        Scenario::Race => run_race(&replay).await?,
        Scenario::Reactions => run_reactions(&replay).await?,
        Scenario::Turn => run_turn(&replay).await?,
        Scenario::All => {
            run_paginate(&replay).await?;
            run_race(&replay).await?;
            run_reactions(&replay).await?;
            run_turn(&replay).await?;
        }
    }
    println!("runner_ok=true");
    Ok(())
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut db_path = None;
    let mut config_path = None;
    let mut pending = args.into_iter();

    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--scenario" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-scenario-value",
                    arg: "--scenario",
                })?;
                let parsed = Scenario::parse(&value).context(UnknownScenarioSnafu {
                    stage: "parse-args-scenario",
                    raw: value,
                })?;
                scenario = Some(parsed);
            }
            "--db" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-db-value",
                    arg: "--db",
                })?;
                db_path = Some(value);
            }
            "--config" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-config-value",
                    arg: "--config",
                })?;
                config_path = Some(value);
            }
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    Ok(RunnerArgs {
        scenario: scenario.context(MissingScenarioSnafu {
            stage: "parse-args-scenario-required",
        })?,
        db_path,
        config_path,
    })
}

struct Fixture {
    session: ChatSession,
    store: Arc<dyn HistoryStore>,
    transport: Arc<ScriptedTransport>,
    navigator: Arc<RecordingNavigator>,
    sidebar: Arc<RecordingSidebar>,
}

impl Fixture {
    fn open(
        replay: &Replay,
        store: Arc<dyn HistoryStore>,
        url_id: Option<&ConversationId>,
    ) -> Self {
        let transport = Arc::new(ScriptedTransport::new());
        let navigator = Arc::new(RecordingNavigator::new());
        let sidebar = Arc::new(RecordingSidebar::new());
        let deps = SessionDeps {
            store: store.clone(),
            transport: transport.clone(),
            navigator: navigator.clone(),
            sidebar: sidebar.clone(),
        };
        let session = ChatSession::open(
            replay.settings.clone(),
            deps,
            url_id.map(ConversationId::as_str),
            None,
        );

        Self {
            session,
            store,
            transport,
            navigator,
            sidebar,
        }
    }
}

async fn open_store(db_path: Option<&str>) -> RunnerResult<Arc<dyn HistoryStore>> {
    match db_path {
        Some(path) => {
            let store = SqliteStore::open(path).await.context(StorageSnafu {
                stage: "open-sqlite-store",
            })?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(MemoryStore::new())),
    }
}

/// Fixed-row viewport standing in for a rendered transcript.
struct ReplayViewport {
    metrics: ViewportMetrics,
}

impl ReplayViewport {
    fn at_top(message_count: usize) -> Self {
        Self {
            metrics: ViewportMetrics {
                offset_y: 0.0,
                content_height: rows_height(message_count),
                viewport_height: REPLAY_VIEWPORT_HEIGHT_PX,
            },
        }
    }

    fn render(&mut self, message_count: usize) {
        self.metrics.content_height = rows_height(message_count);
    }
}

impl Viewport for ReplayViewport {
    fn metrics(&self) -> ViewportMetrics {
        self.metrics
    }

    fn set_offset(&mut self, offset_y: f32) {
        self.metrics.offset_y = offset_y.clamp(0.0, self.metrics.max_offset());
    }
}

fn rows_height(message_count: usize) -> f32 {
    message_count as f32 * REPLAY_ROW_HEIGHT_PX
}

fn numbered_message(index: usize) -> Message {
    let id = MessageId::new(format!("m{index:03}"));
    if index % 2 == 1 {
        Message::user_text(id, format!("question {index}"))
    } else {
        Message::assistant_text(id, format!("answer {index}"))
    }
}

fn check(condition: bool, scenario: &'static str, reason: impl Into<String>) -> RunnerResult<()> {
    if condition {
        return Ok(());
    }
    ScenarioFailedSnafu {
        stage: "scenario-check",
        scenario,
        reason: reason.into(),
    }
    .fail()
}

async fn run_paginate(replay: &Replay) -> RunnerResult<()> {
    let store = open_store(replay.db_path.as_deref()).await?;
    let conversation_id = ConversationId::generate();
    for index in 1..=SEEDED_MESSAGE_COUNT {
        store
            .save_message(conversation_id.clone(), numbered_message(index))
            .await
            .context(StorageSnafu {
                stage: "paginate-seed",
            })?;
    }

    let fixture = Fixture::open(replay, store, Some(&conversation_id));
    let session = &fixture.session;

    let initial = session.load_initial().await;
    let initial_count = session.merged_messages().len();
    println!("paginate_initial_outcome={initial:?}");
    println!("paginate_initial_count={initial_count}");
    println!("paginate_has_more={}", session.has_more_history());
    check(
        initial_count == session.settings().initial_page_size,
        "paginate",
        format!("initial page held {initial_count} messages"),
    )?;

    let mut viewport = ReplayViewport::at_top(initial_count);
    let mut anchor = ScrollAnchor::new(session.settings().pre_trigger_margin_px);
    let decision = anchor.on_sentinel(
        0.0,
        session.has_more_history(),
        session.is_loading_older(),
        &viewport,
    );
    println!("paginate_sentinel={decision:?}");
    check(
        decision == SentinelDecision::LoadOlder,
        "paginate",
        format!("sentinel at the top answered {decision:?}"),
    )?;

    let older = session.load_older().await;
    let messages = session.merged_messages();
    viewport.render(messages.len());
    let shift = anchor.on_layout_committed(&mut viewport).unwrap_or(0.0);
    println!("paginate_scroll_shift_px={shift}");
    check(
        shift == rows_height(messages.len() - initial_count),
        "paginate",
        "scroll offset did not follow the prepended rows",
    )?;

    println!("paginate_older_outcome={older:?}");
    let mut messages = messages;
    while session.has_more_history() {
        if session.load_older().await == ReconcileOutcome::NoProgress {
            break;
        }
        messages = session.merged_messages();
    }
    println!("paginate_total_count={}", messages.len());
    println!("paginate_has_more_after_older={}", session.has_more_history());

    let ordered = messages
        .windows(2)
        .all(|pair| pair[0].id.as_str() < pair[1].id.as_str());
    println!("paginate_ordered={ordered}");
    check(
        messages.len() == SEEDED_MESSAGE_COUNT && ordered && !session.has_more_history(),
        "paginate",
        "full history was not reassembled in order",
    )?;

    let exhausted = session.load_older().await;
    println!("paginate_exhausted_outcome={exhausted:?}");
    check(
        exhausted == ReconcileOutcome::NoProgress,
        "paginate",
        "load past the start of history made progress",
    )
}

async fn run_race(replay: &Replay) -> RunnerResult<()> {
    let store = open_store(replay.db_path.as_deref()).await?;
    let fixture = Fixture::open(replay, store, None);
    let session = &fixture.session;
    let assigned = ConversationId::generate();
    let gate = Arc::new(Notify::new());

    fixture.transport.push_script(
        TurnScript::new()
            .conversation_id(assigned.as_str())
            .text("Hello")
            .wait_for(gate.clone())
            .text(" world"),
    );
    session.submit("Hi").context(SessionSnafu {
        stage: "race-submit",
    })?;

    let mut identity = session.subscribe_identity();
    let fetch_after_assignment = async {
        let _ = identity
            .wait_for(|identity| identity.active_id.is_some())
            .await
            .map(|_| ());
        let outcome = session.load_initial().await;
        gate.notify_one();
        outcome
    };
    let (applied, outcome) = futures::join!(session.pump_turn(), fetch_after_assignment);

    let messages = session.merged_messages();
    let navigated = fixture.navigator.paths();
    println!("race_events_applied={applied}");
    println!("race_initial_outcome={outcome:?}");
    println!("race_message_count={}", messages.len());
    println!("race_navigations={}", navigated.len());
    println!(
        "race_active_id_matches={}",
        session.active_conversation_id().as_ref() == Some(&assigned)
    );

    check(
        outcome == ReconcileOutcome::Skipped,
        "race",
        format!("first fetch after assignment was {outcome:?}"),
    )?;
    check(
        messages.len() == 2 && messages[1].text() == "Hello world",
        "race",
        "live transcript lost content",
    )?;
    check(navigated.len() == 1, "race", "expected exactly one navigation")
}

async fn run_reactions(replay: &Replay) -> RunnerResult<()> {
    let store = open_store(replay.db_path.as_deref()).await?;
    let conversation_id = ConversationId::generate();
    let message_id = MessageId::new("answer");
    store
        .save_message(
            conversation_id.clone(),
            Message::assistant_text(message_id.clone(), "Here you go."),
        )
        .await
        .context(StorageSnafu {
            stage: "reactions-seed",
        })?;

    let fixture = Fixture::open(replay, store, Some(&conversation_id));
    let session = &fixture.session;
    session.load_initial().await;

    let mut outcomes = Vec::new();
    for requested in [Reaction::Like, Reaction::Like, Reaction::Dislike] {
        let outcome = session
            .toggle_reaction(&message_id, requested)
            .await
            .context(SessionSnafu {
                stage: "reactions-toggle",
            })?;
        println!("reactions_toggle_{}={outcome:?}", requested.as_str());
        outcomes.push(outcome);
    }

    let page = fixture
        .store
        .list_messages(PageRequest::latest(conversation_id, 1))
        .await
        .context(StorageSnafu {
            stage: "reactions-read-back",
        })?;
    let stored = page.messages.first().and_then(Message::reaction);
    println!("reactions_stored={}", stored.map_or("none", |reaction| reaction.as_str()));

    check(
        outcomes
            == vec![
                ReactionOutcome::Confirmed(Some(Reaction::Like)),
                ReactionOutcome::Confirmed(None),
                ReactionOutcome::Confirmed(Some(Reaction::Dislike)),
            ],
        "reactions",
        "toggle sequence did not settle as expected",
    )?;
    check(
        stored == Some(Reaction::Dislike),
        "reactions",
        "stored reaction does not match the last toggle",
    )
}

async fn run_turn(replay: &Replay) -> RunnerResult<()> {
    let store = open_store(replay.db_path.as_deref()).await?;
    let fixture = Fixture::open(replay, store, None);
    let session = &fixture.session;
    let assigned = ConversationId::generate();

    fixture.transport.push_script(
        TurnScript::new()
            .conversation_id(assigned.as_str())
            .title("Trip planning")
            .event(
                "data-progress",
                json!({ "step": { "id": "s1", "label": "Search", "status": "done" } }),
            )
            .event(
                "data-sources",
                json!({ "sources": [{ "id": "1", "url": "https://example.com/guide" }] }),
            )
            .event("finish-step", json!({}))
            .text("Sure."),
    );
    session.submit("Plan a trip").context(SessionSnafu {
        stage: "turn-submit",
    })?;
    let applied = session.pump_turn().await;

    let requests = fixture.transport.requests();
    let assistant_id = requests
        .first()
        .map(|request| request.assistant_message_id.clone())
        .context(ScenarioFailedSnafu {
            stage: "turn-request",
            scenario: "turn",
            reason: "no request reached the transport".to_string(),
        })?;
    let sidebar_title = fixture
        .sidebar
        .latest_for(&assigned)
        .map(|entry| entry.name)
        .unwrap_or_default();

    println!("turn_events_applied={applied}");
    println!("turn_status={:?}", session.status());
    println!("turn_title={}", session.title());
    println!("turn_sidebar_title={sidebar_title}");
    println!("turn_progress_steps={}", session.progress_for(&assistant_id).len());
    println!("turn_sources={}", session.sources_for(&assistant_id).len());

    check(
        session.status() == StreamStatus::Ready && session.title() == "Trip planning",
        "turn",
        "turn did not finish with its title",
    )?;
    check(
        sidebar_title == "Trip planning",
        "turn",
        "sidebar entry was not renamed",
    )
}
