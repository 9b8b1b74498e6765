//! Console wizard for the first-boot session.
//!
//! Layout:
//! - Centered window titled "First-boot setup"
//! - Left panel with the step list, right panel with the current page
//! - Status line and a bottom button row: [ Back ] [ Next ] [ Cancel ]
//! - Modal confirmation before cancelling
//!
//! Note: logging is file-only while the UI owns the terminal.

use crate::error::{exit_code, WizardError};
use crate::installation::{OutputLine, OutputStream};
use crate::models::{KeySet, StepId};
use crate::wizard::steps::{ssh_key, RunnerInput, Step, StepInput, WifiInput};
use crate::wizard::{Controller, Phase};
use anyhow::Result;
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::ExecutableCommand;
use log::{info, warn};
use ratatui::backend::{Backend, CrosstermBackend, TestBackend};
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Margin, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, Clear, Paragraph, Wrap};
use ratatui::{Frame, Terminal};
use secrecy::SecretString;
use std::io::{self, Stdout};
use std::time::Duration;
use tokio::runtime::Runtime;

const LOGO: &str = r#"            _
  ___  ___ | |_ _  _ _ __
 (_-< / -_)|  _| || | '_ \
 /__/ \___| \__|\_,_| .__/
                    |_|"#;

const WINDOW_TITLE: &str = "First-boot setup";
const APPLY_LOG_LINES: usize = 200;
const SUGGESTION_LIMIT: usize = 6;
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Page {
    Welcome,
    SshKey,
    Runner,
    Hostname,
    Timezone,
    Wifi,
    Review,
    Applying,
    Done,
    Failed,
    Aborted,
}

impl Page {
    pub const ALL: [Page; 11] = [
        Page::Welcome,
        Page::SshKey,
        Page::Runner,
        Page::Hostname,
        Page::Timezone,
        Page::Wifi,
        Page::Review,
        Page::Applying,
        Page::Done,
        Page::Failed,
        Page::Aborted,
    ];

    /// Name accepted by `--tui-smoke=<page>`.
    pub fn slug(&self) -> &'static str {
        match self {
            Page::Welcome => "welcome",
            Page::SshKey => "ssh-key",
            Page::Runner => "runner",
            Page::Hostname => "hostname",
            Page::Timezone => "timezone",
            Page::Wifi => "wifi",
            Page::Review => "review",
            Page::Applying => "applying",
            Page::Done => "done",
            Page::Failed => "failed",
            Page::Aborted => "aborted",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Page> {
        let slug = slug.trim().to_ascii_lowercase();
        Page::ALL.into_iter().find(|p| p.slug() == slug)
    }

    fn for_step(id: StepId) -> Page {
        match id {
            StepId::SshKey => Page::SshKey,
            StepId::Runner => Page::Runner,
            StepId::Hostname => Page::Hostname,
            StepId::Timezone => Page::Timezone,
            StepId::Wifi => Page::Wifi,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ButtonFocus {
    Back,
    Next,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FocusTarget {
    Field(usize),
    Button(ButtonFocus),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Modal {
    /// `yes` is the highlighted choice.
    ConfirmCancel { yes: bool },
    Message { title: String, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeySource {
    Account,
    Paste,
    File,
}

impl KeySource {
    fn as_str(&self) -> &'static str {
        match self {
            KeySource::Account => "Fetch by account",
            KeySource::Paste => "Paste a key",
            KeySource::File => "Load a file",
        }
    }

    fn input_label(&self) -> &'static str {
        match self {
            KeySource::Account => "Account",
            KeySource::Paste => "Key",
            KeySource::File => "Path",
        }
    }

    fn next(&self) -> Self {
        match self {
            KeySource::Account => KeySource::Paste,
            KeySource::Paste => KeySource::File,
            KeySource::File => KeySource::Account,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Status {
    Info(String),
    Error(String),
}

/// Work the event loop must do outside the key handler (it needs the terminal).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UiEffect {
    None,
    FetchKeys,
    ScanWifi,
    Submit,
}

#[derive(Debug, Clone)]
struct TextInput {
    value: String,
    /// Cursor position in characters.
    cursor: usize,
    masked: bool,
}

impl TextInput {
    fn new(value: impl Into<String>, masked: bool) -> Self {
        let v = value.into();
        Self {
            cursor: v.chars().count(),
            value: v,
            masked,
        }
    }

    fn display(&self) -> String {
        if self.masked {
            "*".repeat(self.value.chars().count())
        } else {
            self.value.clone()
        }
    }

    fn set(&mut self, value: impl Into<String>) {
        self.value = value.into();
        self.cursor = self.value.chars().count();
    }

    fn clear(&mut self) {
        self.set(String::new());
    }

    fn byte_index(&self, cursor: usize) -> usize {
        self.value
            .char_indices()
            .nth(cursor)
            .map(|(i, _)| i)
            .unwrap_or(self.value.len())
    }

    fn handle_key(&mut self, code: KeyCode) -> bool {
        let len = self.value.chars().count();
        match code {
            KeyCode::Char(c) => {
                let at = self.byte_index(self.cursor);
                self.value.insert(at, c);
                self.cursor += 1;
                true
            }
            KeyCode::Backspace => {
                if self.cursor > 0 {
                    let at = self.byte_index(self.cursor - 1);
                    self.value.remove(at);
                    self.cursor -= 1;
                }
                true
            }
            KeyCode::Delete => {
                if self.cursor < len {
                    let at = self.byte_index(self.cursor);
                    self.value.remove(at);
                }
                true
            }
            KeyCode::Left => {
                self.cursor = self.cursor.saturating_sub(1);
                true
            }
            KeyCode::Right => {
                self.cursor = (self.cursor + 1).min(len);
                true
            }
            KeyCode::Home => {
                self.cursor = 0;
                true
            }
            KeyCode::End => {
                self.cursor = len;
                true
            }
            _ => false,
        }
    }
}

struct WizardState {
    controller: Controller,
    focus: FocusTarget,
    modal: Option<Modal>,
    status: Option<Status>,
    quit: bool,
    /// Fatal error that ended the session.
    fatal: Option<WizardError>,

    key_source: KeySource,
    key_input: TextInput,
    keys: KeySet,
    key_index: usize,

    runner_token: TextInput,
    runner_name: TextInput,
    runner_labels: TextInput,
    runner_url: TextInput,

    hostname: TextInput,

    timezone: TextInput,
    timezone_index: usize,

    wifi_ssid: TextInput,
    wifi_psk: TextInput,
    wifi_networks: Vec<String>,
    wifi_index: usize,
    wifi_scanned: bool,

    apply_log: Vec<String>,
}

impl WizardState {
    fn new(controller: Controller) -> Self {
        let mut state = Self {
            controller,
            focus: FocusTarget::Button(ButtonFocus::Next),
            modal: None,
            status: None,
            quit: false,
            fatal: None,

            key_source: KeySource::Account,
            key_input: TextInput::new("", false),
            keys: KeySet::new(),
            key_index: 0,

            runner_token: TextInput::new("", true),
            runner_name: TextInput::new("", false),
            runner_labels: TextInput::new("", false),
            runner_url: TextInput::new("", false),

            hostname: TextInput::new("", false),

            timezone: TextInput::new("", false),
            timezone_index: 0,

            wifi_ssid: TextInput::new("", false),
            wifi_psk: TextInput::new("", true),
            wifi_networks: Vec::new(),
            wifi_index: 0,
            wifi_scanned: false,

            apply_log: Vec::new(),
        };

        if let Some(Step::Runner(s)) = state.step(StepId::Runner) {
            let (name, url) = (s.default_name().to_string(), s.default_url().to_string());
            state.runner_name.set(name);
            state.runner_url.set(url);
        }
        if let Some(default) = state.step(StepId::Hostname).and_then(|s| s.prompt().default) {
            state.hostname.set(default);
        }
        state
    }

    fn page(&self) -> Page {
        match self.controller.phase() {
            Phase::Welcome => Page::Welcome,
            Phase::Step(_) => self
                .controller
                .current_step()
                .map(|s| Page::for_step(s.id()))
                .unwrap_or(Page::Review),
            Phase::Review => Page::Review,
            Phase::Applying => Page::Applying,
            Phase::Done => Page::Done,
            Phase::Failed => Page::Failed,
            Phase::Aborted => Page::Aborted,
        }
    }

    fn step(&self, id: StepId) -> Option<&Step> {
        self.controller.steps().iter().find(|s| s.id() == id)
    }

    fn timezone_suggestions(&self) -> Vec<&str> {
        match self.step(StepId::Timezone) {
            Some(Step::Timezone(s)) => s.suggestions(&self.timezone.value, SUGGESTION_LIMIT),
            _ => Vec::new(),
        }
    }

    fn error(&mut self, e: &WizardError) {
        self.status = Some(Status::Error(e.to_string()));
    }

    /// Exit code for the way the session ended.
    fn exit_code(&self) -> i32 {
        if let Some(e) = self.fatal.as_ref() {
            return e.exit_code();
        }
        match self.controller.phase() {
            Phase::Done => exit_code::OK,
            _ => exit_code::FAILED,
        }
    }
}

fn page_title(page: Page) -> &'static str {
    match page {
        Page::Welcome => "Welcome",
        Page::SshKey => "SSH keys",
        Page::Runner => "CI runner",
        Page::Hostname => "Hostname",
        Page::Timezone => "Timezone",
        Page::Wifi => "WiFi",
        Page::Review => "Review",
        Page::Applying => "Applying configuration",
        Page::Done => "Completed",
        Page::Failed => "Rebuild failed",
        Page::Aborted => "Setup aborted",
    }
}

fn next_label(page: Page) -> &'static str {
    match page {
        Page::Welcome => "Start",
        Page::Review => "Apply",
        Page::Failed => "Retry",
        Page::Done => "Finish",
        Page::Aborted => "Close",
        _ => "Next",
    }
}

fn can_go_back(page: Page) -> bool {
    matches!(
        page,
        Page::SshKey
            | Page::Runner
            | Page::Hostname
            | Page::Timezone
            | Page::Wifi
            | Page::Review
            | Page::Failed
    )
}

fn can_cancel(page: Page) -> bool {
    !matches!(page, Page::Applying | Page::Done | Page::Aborted)
}

fn page_field_count(page: Page) -> usize {
    match page {
        Page::SshKey => 3,
        Page::Runner => 4,
        Page::Hostname | Page::Timezone => 1,
        Page::Wifi => 2,
        _ => 0,
    }
}

fn first_focus(page: Page) -> FocusTarget {
    match page {
        Page::SshKey => FocusTarget::Field(1),
        p if page_field_count(p) > 0 => FocusTarget::Field(0),
        _ => FocusTarget::Button(ButtonFocus::Next),
    }
}

pub fn run(controller: Controller, rt: &Runtime) -> Result<i32> {
    info!("[PHASE: tui] [STEP: start] Starting console wizard");

    let mut terminal = setup_terminal()?;
    let result = run_loop(&mut terminal, WizardState::new(controller), rt);
    restore_terminal(&mut terminal)?;

    result
}

/// Render a single frame of `target` into an in-memory backend.
pub fn smoke(controller: Controller, target: &str) -> Result<()> {
    let page = Page::from_slug(target)
        .ok_or_else(|| anyhow::anyhow!("Unknown TUI page '{}'", target))?;
    info!(
        "[PHASE: tui] [STEP: smoke] Rendering single-frame smoke target={}",
        page.slug()
    );
    let mut state = WizardState::new(controller);
    state.focus = first_focus(page);
    render_to_buffer(&state, page, 100, 30)?;
    Ok(())
}

fn render_to_buffer(
    state: &WizardState,
    page: Page,
    width: u16,
    height: u16,
) -> Result<ratatui::buffer::Buffer> {
    let backend = TestBackend::new(width, height);
    let mut terminal = Terminal::new(backend)?;
    if page == Page::Applying {
        terminal.draw(|f| draw_applying(f, f.size(), &state.apply_log, 1))?;
    } else {
        terminal.draw(|f| draw(f, f.size(), state, page))?;
    }
    Ok(terminal.backend().buffer().clone())
}

fn setup_terminal() -> Result<Terminal<CrosstermBackend<Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    stdout.execute(EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let terminal = Terminal::new(backend)?;
    Ok(terminal)
}

fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
    disable_raw_mode()?;
    terminal.backend_mut().execute(LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

fn run_loop<B: Backend>(
    terminal: &mut Terminal<B>,
    mut state: WizardState,
    rt: &Runtime,
) -> Result<i32> {
    while !state.quit {
        let page = state.page();
        terminal.draw(|f| draw(f, f.size(), &state, page))?;

        if page == Page::Wifi && !state.wifi_scanned {
            state.status = Some(Status::Info("Scanning for networks...".to_string()));
            terminal.draw(|f| draw(f, f.size(), &state, page))?;
            scan_wifi(&mut state, rt);
            continue;
        }

        if !event::poll(POLL_INTERVAL)? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        let code = if key.modifiers.contains(KeyModifiers::CONTROL)
            && matches!(key.code, KeyCode::Char('c'))
        {
            KeyCode::Esc
        } else {
            key.code
        };

        match handle_key(&mut state, code) {
            UiEffect::None => {}
            UiEffect::FetchKeys => {
                terminal.draw(|f| draw(f, f.size(), &state, page))?;
                add_keys(&mut state, rt);
            }
            UiEffect::ScanWifi => scan_wifi(&mut state, rt),
            UiEffect::Submit => submit(terminal, &mut state, rt)?,
        }
    }

    Ok(state.exit_code())
}

/// Run the apply phase, redrawing the log view for every output line.
fn submit<B: Backend>(
    terminal: &mut Terminal<B>,
    state: &mut WizardState,
    rt: &Runtime,
) -> Result<()> {
    state.apply_log.clear();
    state.status = None;
    let attempt = state.controller.attempts() + 1;
    terminal.draw(|f| draw_applying(f, f.size(), &state.apply_log, attempt))?;

    let WizardState {
        controller,
        apply_log,
        ..
    } = state;
    let result = rt.block_on(controller.submit(|line| {
        push_output(apply_log, line);
        if let Err(e) =
            terminal.draw(|f| draw_applying(f, f.size(), apply_log.as_slice(), attempt))
        {
            warn!("[PHASE: tui] [STEP: apply] redraw failed: {}", e);
        }
    }));

    // Once written, the token lives only in its file.
    if token_persisted(state) {
        state.runner_token.clear();
    }

    match result {
        Ok(report) => {
            state.status = Some(Status::Info(format!(
                "Applied in {}s",
                report.duration_ms / 1000
            )));
        }
        Err(e) if e.is_fatal() => {
            state.modal = Some(Modal::Message {
                title: "Setup aborted".to_string(),
                body: format!(
                    "{}\n\nNothing was applied. Fix the problem and run setup-tool again.",
                    e
                ),
            });
            state.fatal = Some(e);
        }
        Err(e @ WizardError::Apply { .. }) => {
            state.status = Some(Status::Error(e.to_string()));
        }
        Err(e) => state.error(&e),
    }
    state.focus = FocusTarget::Button(ButtonFocus::Next);
    Ok(())
}

fn token_persisted(state: &WizardState) -> bool {
    state
        .controller
        .answers()
        .runner()
        .is_some_and(|r| r.token.is_none())
}

fn push_output(log: &mut Vec<String>, line: OutputLine) {
    let text = match line.stream {
        OutputStream::Stdout => line.text,
        OutputStream::Stderr => format!("! {}", line.text),
    };
    log.push(text);
    if log.len() > APPLY_LOG_LINES {
        let excess = log.len() - APPLY_LOG_LINES;
        log.drain(..excess);
    }
}

fn add_keys(state: &mut WizardState, rt: &Runtime) {
    let Some(Step::SshKey(step)) = state.step(StepId::SshKey).cloned() else {
        return;
    };
    let source = state.key_input.value.trim().to_string();
    if source.is_empty() {
        state.status = Some(Status::Error(format!(
            "{} is empty",
            state.key_source.input_label()
        )));
        return;
    }

    let result = match state.key_source {
        KeySource::Account => rt.block_on(step.fetch_by_account(&source)),
        KeySource::Paste => Ok(ssh_key::parse_pasted(&source)),
        KeySource::File => ssh_key::load_from_path(&source),
    };
    match result {
        Ok(batch) => {
            let first_rejection = batch.rejected.first().map(|r| r.error.to_string());
            let rejected = batch.rejected.len();
            let added = state.keys.extend(batch.accepted);
            state.status = match (added, first_rejection) {
                (0, Some(reason)) => Some(Status::Error(reason)),
                (0, None) => Some(Status::Info("Key already in the list".to_string())),
                (n, _) if rejected > 0 => Some(Status::Info(format!(
                    "Added {} key(s); {} line(s) rejected",
                    n, rejected
                ))),
                (n, _) => Some(Status::Info(format!("Added {} key(s)", n))),
            };
            if added > 0 {
                state.key_input.clear();
                state.key_index = state.keys.len() - 1;
            }
        }
        Err(e) => state.error(&e),
    }
}

fn scan_wifi(state: &mut WizardState, rt: &Runtime) {
    state.wifi_scanned = true;
    let Some(Step::Wifi(step)) = state.step(StepId::Wifi).cloned() else {
        return;
    };
    state.wifi_networks = rt.block_on(step.scan_networks());
    state.wifi_index = 0;
    state.status = Some(Status::Info(if state.wifi_networks.is_empty() {
        "No networks found (F5 scans again)".to_string()
    } else {
        format!(
            "{} network(s) found; Up/Down picks one",
            state.wifi_networks.len()
        )
    }));
}

fn step_input(state: &WizardState, page: Page) -> Option<StepInput> {
    Some(match page {
        Page::SshKey => StepInput::SshKeys(state.keys.clone()),
        Page::Runner => StepInput::Runner(if state.runner_token.value.trim().is_empty() {
            RunnerInput::Skip
        } else {
            RunnerInput::Configure {
                token: SecretString::from(state.runner_token.value.clone()),
                name: state.runner_name.value.clone(),
                labels: state.runner_labels.value.clone(),
                url: state.runner_url.value.clone(),
            }
        }),
        Page::Hostname => StepInput::Hostname(state.hostname.value.clone()),
        Page::Timezone => StepInput::Timezone(state.timezone.value.clone()),
        Page::Wifi => StepInput::Wifi(if state.wifi_ssid.value.trim().is_empty() {
            WifiInput::Skip
        } else {
            WifiInput::Configure {
                ssid: state.wifi_ssid.value.clone(),
                passphrase: SecretString::from(state.wifi_psk.value.clone()),
            }
        }),
        _ => return None,
    })
}

fn on_next(state: &mut WizardState) -> UiEffect {
    let page = state.page();
    let result = match page {
        Page::Welcome => state.controller.start(),
        Page::Review => return UiEffect::Submit,
        Page::Failed => match state.controller.back() {
            Ok(_) => return UiEffect::Submit,
            Err(e) => Err(e),
        },
        Page::Done | Page::Aborted => {
            state.quit = true;
            return UiEffect::None;
        }
        Page::Applying => return UiEffect::None,
        _ => match step_input(state, page) {
            Some(input) => state.controller.advance(input),
            None => return UiEffect::None,
        },
    };
    match result {
        Ok(_) => {
            state.status = None;
            state.focus = first_focus(state.page());
        }
        Err(e) => state.error(&e),
    }
    UiEffect::None
}

fn on_back(state: &mut WizardState) {
    match state.controller.back() {
        Ok(_) => {
            state.status = None;
            state.focus = first_focus(state.page());
        }
        Err(e) => state.error(&e),
    }
}

fn handle_key(state: &mut WizardState, code: KeyCode) -> UiEffect {
    if let Some(modal) = state.modal.clone() {
        match modal {
            Modal::ConfirmCancel { yes } => match code {
                KeyCode::Left | KeyCode::Right | KeyCode::Tab => {
                    state.modal = Some(Modal::ConfirmCancel { yes: !yes });
                }
                KeyCode::Esc => state.modal = None,
                KeyCode::Enter => {
                    state.modal = None;
                    if yes {
                        match state.controller.cancel() {
                            Ok(_) => state.quit = true,
                            Err(e) => state.error(&e),
                        }
                    }
                }
                _ => {}
            },
            Modal::Message { .. } => {
                if matches!(code, KeyCode::Enter | KeyCode::Esc) {
                    state.modal = None;
                    if state.fatal.is_some() {
                        state.quit = true;
                    }
                }
            }
        }
        return UiEffect::None;
    }

    let page = state.page();
    let fields = page_field_count(page);

    match code {
        KeyCode::Esc => {
            if can_cancel(page) {
                state.modal = Some(Modal::ConfirmCancel { yes: false });
            }
            return UiEffect::None;
        }
        KeyCode::Tab => {
            state.focus = match state.focus {
                FocusTarget::Field(i) if i + 1 < fields => FocusTarget::Field(i + 1),
                FocusTarget::Field(_) => FocusTarget::Button(ButtonFocus::Next),
                FocusTarget::Button(_) if fields > 0 => FocusTarget::Field(0),
                FocusTarget::Button(b) => FocusTarget::Button(b),
            };
            return UiEffect::None;
        }
        KeyCode::BackTab => {
            state.focus = match state.focus {
                FocusTarget::Field(0) => FocusTarget::Button(ButtonFocus::Next),
                FocusTarget::Field(i) => FocusTarget::Field(i - 1),
                FocusTarget::Button(_) if fields > 0 => FocusTarget::Field(fields - 1),
                FocusTarget::Button(b) => FocusTarget::Button(b),
            };
            return UiEffect::None;
        }
        KeyCode::F(5) if page == Page::Wifi => return UiEffect::ScanWifi,
        _ => {}
    }

    match state.focus {
        FocusTarget::Field(i) => handle_field_key(state, page, i, code),
        FocusTarget::Button(b) => match code {
            KeyCode::Left => {
                state.focus = FocusTarget::Button(match b {
                    ButtonFocus::Cancel => ButtonFocus::Next,
                    _ => ButtonFocus::Back,
                });
                UiEffect::None
            }
            KeyCode::Right => {
                state.focus = FocusTarget::Button(match b {
                    ButtonFocus::Back => ButtonFocus::Next,
                    _ => ButtonFocus::Cancel,
                });
                UiEffect::None
            }
            KeyCode::Enter => match b {
                ButtonFocus::Back if can_go_back(page) => {
                    on_back(state);
                    UiEffect::None
                }
                ButtonFocus::Cancel if can_cancel(page) => {
                    state.modal = Some(Modal::ConfirmCancel { yes: false });
                    UiEffect::None
                }
                ButtonFocus::Next => on_next(state),
                _ => UiEffect::None,
            },
            _ => UiEffect::None,
        },
    }
}

fn handle_field_key(state: &mut WizardState, page: Page, field: usize, code: KeyCode) -> UiEffect {
    match (page, field) {
        (Page::SshKey, 0) => {
            if matches!(
                code,
                KeyCode::Left | KeyCode::Right | KeyCode::Char(' ') | KeyCode::Enter
            ) {
                state.key_source = state.key_source.next();
            }
            UiEffect::None
        }
        (Page::SshKey, 1) => {
            if code == KeyCode::Enter {
                if state.key_input.value.trim().is_empty() {
                    return on_next(state);
                }
                if state.key_source == KeySource::Account {
                    state.status = Some(Status::Info(format!(
                        "Fetching keys for {}...",
                        state.key_input.value.trim()
                    )));
                }
                return UiEffect::FetchKeys;
            }
            state.key_input.handle_key(code);
            UiEffect::None
        }
        (Page::SshKey, _) => {
            match code {
                KeyCode::Up => state.key_index = state.key_index.saturating_sub(1),
                KeyCode::Down if state.key_index + 1 < state.keys.len() => state.key_index += 1,
                KeyCode::Delete | KeyCode::Backspace => {
                    if state.keys.remove(state.key_index).is_some() {
                        state.key_index = state.key_index.min(state.keys.len().saturating_sub(1));
                        state.status = Some(Status::Info("Key removed".to_string()));
                    }
                }
                KeyCode::Enter => return on_next(state),
                _ => {}
            }
            UiEffect::None
        }
        (Page::Timezone, _) => {
            let suggestions: Vec<String> = state
                .timezone_suggestions()
                .into_iter()
                .map(str::to_string)
                .collect();
            match code {
                KeyCode::Up => state.timezone_index = state.timezone_index.saturating_sub(1),
                KeyCode::Down if state.timezone_index + 1 < suggestions.len() => {
                    state.timezone_index += 1
                }
                KeyCode::Enter => {
                    let typed = state.timezone.value.trim().to_string();
                    let exact = suggestions.iter().any(|z| *z == typed);
                    match suggestions.get(state.timezone_index) {
                        Some(zone) if !typed.is_empty() && !exact => {
                            state.timezone.set(zone.clone());
                            state.timezone_index = 0;
                        }
                        _ => return on_next(state),
                    }
                }
                other => {
                    if state.timezone.handle_key(other) {
                        state.timezone_index = 0;
                    }
                }
            }
            UiEffect::None
        }
        (Page::Wifi, 0) if matches!(code, KeyCode::Up | KeyCode::Down) => {
            if !state.wifi_networks.is_empty() {
                let n = state.wifi_networks.len();
                state.wifi_index = match code {
                    KeyCode::Up => (state.wifi_index + n - 1) % n,
                    _ => (state.wifi_index + 1) % n,
                };
                let ssid = state.wifi_networks[state.wifi_index].clone();
                state.wifi_ssid.set(ssid);
            }
            UiEffect::None
        }
        (_, _) if code == KeyCode::Enter => {
            if field + 1 < page_field_count(page) {
                state.focus = FocusTarget::Field(field + 1);
                UiEffect::None
            } else {
                on_next(state)
            }
        }
        (_, _) => {
            if let Some(input) = focused_text_input_mut(state, page, field) {
                input.handle_key(code);
            }
            UiEffect::None
        }
    }
}

fn focused_text_input_mut(
    state: &mut WizardState,
    page: Page,
    field: usize,
) -> Option<&mut TextInput> {
    match (page, field) {
        (Page::Runner, 0) => Some(&mut state.runner_token),
        (Page::Runner, 1) => Some(&mut state.runner_name),
        (Page::Runner, 2) => Some(&mut state.runner_labels),
        (Page::Runner, 3) => Some(&mut state.runner_url),
        (Page::Hostname, 0) => Some(&mut state.hostname),
        (Page::Wifi, 0) => Some(&mut state.wifi_ssid),
        (Page::Wifi, 1) => Some(&mut state.wifi_psk),
        _ => None,
    }
}

fn pointer(state: &WizardState, field: usize) -> &'static str {
    if state.focus == FocusTarget::Field(field) {
        ">"
    } else {
        " "
    }
}

fn input_line(state: &WizardState, field: usize, label: &str, input: &TextInput) -> Line<'static> {
    let cursor = if state.focus == FocusTarget::Field(field) {
        "_"
    } else {
        ""
    };
    Line::from(format!(
        "{} {}: {}{}",
        pointer(state, field),
        label,
        input.display(),
        cursor
    ))
}

fn help_line(state: &WizardState, id: StepId) -> Line<'static> {
    let help = state.step(id).map(|s| s.prompt().help).unwrap_or_default();
    Line::from(Span::styled(help, Style::default().fg(Color::Gray)))
}

fn page_text(state: &WizardState, page: Page) -> Text<'static> {
    match page {
        Page::Welcome => Text::from(vec![
            Line::from("This wizard configures the device on first boot."),
            Line::from(""),
            Line::from("It asks for SSH keys, an optional CI runner, the hostname,"),
            Line::from("the timezone and optional WiFi, then rebuilds the system once."),
            Line::from(""),
            Line::from("Nothing is changed until you confirm on the Review page."),
            Line::from(""),
            Line::from("Tab moves between fields, Enter confirms, Esc cancels."),
        ]),
        Page::SshKey => {
            let mut lines = vec![
                help_line(state, StepId::SshKey),
                Line::from(""),
                Line::from(format!(
                    "{} Source: < {} >",
                    pointer(state, 0),
                    state.key_source.as_str()
                )),
                input_line(state, 1, state.key_source.input_label(), &state.key_input),
                Line::from(""),
                Line::from(format!("{} Keys to install:", pointer(state, 2))),
            ];
            if state.keys.is_empty() {
                lines.push(Line::from(Span::styled(
                    "    (none: password login stays enabled)",
                    Style::default().fg(Color::Yellow),
                )));
            }
            for (i, entry) in state.keys.iter().enumerate() {
                let marker = if state.focus == FocusTarget::Field(2) && i == state.key_index {
                    "*"
                } else {
                    " "
                };
                lines.push(Line::from(format!("  {} {}. {}", marker, i + 1, entry.summary())));
            }
            lines.push(Line::from(""));
            lines.push(Line::from(
                "Enter adds from the source. Del removes the selected key.",
            ));
            Text::from(lines)
        }
        Page::Runner => Text::from(vec![
            help_line(state, StepId::Runner),
            Line::from(""),
            input_line(state, 0, "Token", &state.runner_token),
            input_line(state, 1, "Name", &state.runner_name),
            input_line(state, 2, "Labels", &state.runner_labels),
            input_line(state, 3, "URL or URL file", &state.runner_url),
            Line::from(""),
            Line::from(if token_persisted(state) {
                "The token was already saved. Enter it again to keep the runner; empty skips it."
            } else {
                "The token is written to a file only the runner can read."
            }),
        ]),
        Page::Hostname => Text::from(vec![
            help_line(state, StepId::Hostname),
            Line::from(""),
            input_line(state, 0, "Hostname", &state.hostname),
        ]),
        Page::Timezone => {
            let default = state
                .step(StepId::Timezone)
                .and_then(|s| s.prompt().default)
                .unwrap_or_default();
            let mut lines = vec![
                help_line(state, StepId::Timezone),
                Line::from(format!("Leave empty to keep {}.", default)),
                Line::from(""),
                input_line(state, 0, "Timezone", &state.timezone),
                Line::from(""),
            ];
            let suggestions = state.timezone_suggestions();
            if suggestions.is_empty() {
                lines.push(Line::from("  (no matching zone)"));
            }
            for (i, zone) in suggestions.iter().enumerate() {
                let style = if i == state.timezone_index {
                    Style::default().add_modifier(Modifier::REVERSED)
                } else {
                    Style::default()
                };
                lines.push(Line::from(Span::styled(format!("  {}", zone), style)));
            }
            Text::from(lines)
        }
        Page::Wifi => {
            let mut lines = vec![
                help_line(state, StepId::Wifi),
                Line::from("Leave the network name empty to disable WiFi."),
                Line::from(""),
                input_line(state, 0, "Network", &state.wifi_ssid),
                input_line(state, 1, "Passphrase", &state.wifi_psk),
                Line::from(""),
            ];
            if !state.wifi_networks.is_empty() {
                lines.push(Line::from(format!(
                    "Visible: {}",
                    state.wifi_networks.join(", ")
                )));
            }
            lines.push(Line::from("F5 scans again."));
            Text::from(lines)
        }
        Page::Review => {
            let mut lines = vec![Line::from("The following will be applied:"), Line::from("")];
            for (id, text) in state.controller.answers().summary() {
                lines.push(Line::from(format!("  {:<10} {}", id.as_str(), text)));
            }
            lines.push(Line::from(""));
            lines.push(Line::from(format!(
                "Configuration directory: {}",
                state.controller.applier().config_dir().display()
            )));
            lines.push(Line::from(
                "Apply writes the configuration and rebuilds the system once.",
            ));
            Text::from(lines)
        }
        Page::Applying => Text::from("Rebuilding..."),
        Page::Done => {
            let mut lines = vec![];
            if state.controller.already_configured() {
                lines.push(Line::from("This device is already configured."));
            } else {
                lines.push(Line::from("The configuration was applied."));
            }
            lines.push(Line::from(""));
            lines.push(Line::from(format!(
                "Marker: {}",
                state.controller.gate().marker().display()
            )));
            lines.push(Line::from(""));
            lines.push(Line::from("Select Finish to exit."));
            Text::from(lines)
        }
        Page::Failed => {
            let mut lines = vec![
                Line::from("The system rebuild failed; the previous generation is still active."),
                Line::from("Your answers are kept. Retry applies them again."),
                Line::from(""),
            ];
            match state.controller.last_failure() {
                Some(failure) => {
                    if let Some(hint) = failure.manual_hint.as_ref() {
                        lines.push(Line::from(format!("Manual command: {}", hint)));
                    }
                    lines.push(Line::from(format!("Exit code: {:?}", failure.exit_code)));
                    lines.push(Line::from(""));
                    let tail: Vec<&str> = failure.diagnostics.lines().collect();
                    for l in &tail[tail.len().saturating_sub(12)..] {
                        lines.push(Line::from(l.to_string()));
                    }
                }
                None => lines.push(Line::from("(no diagnostics)")),
            }
            Text::from(lines)
        }
        Page::Aborted => {
            let reason = match state.fatal.as_ref() {
                Some(e) => e.to_string(),
                None => "Setup was cancelled. Nothing was applied.".to_string(),
            };
            Text::from(vec![Line::from(reason), Line::from(""), Line::from("Select Close to exit.")])
        }
    }
}

struct WindowLayout {
    window: Rect,
    banner: Rect,
    content: Rect,
    status: Rect,
    buttons: Rect,
}

fn window_layout(area: Rect) -> WindowLayout {
    let window = centered_window(area, 100, 30);
    let inner = window.inner(&Margin {
        vertical: 1,
        horizontal: 1,
    });
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints(
            [
                Constraint::Min(0),
                Constraint::Length(1),
                Constraint::Length(1),
            ]
            .as_ref(),
        )
        .split(inner);
    let cols = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Length(30), Constraint::Min(0)].as_ref())
        .split(rows[0]);
    WindowLayout {
        window,
        banner: cols[0],
        content: cols[1],
        status: rows[1],
        buttons: rows[2],
    }
}

fn draw(f: &mut Frame<'_>, area: Rect, state: &WizardState, page: Page) {
    let layout = window_layout(area);
    f.render_widget(
        Block::default().borders(Borders::ALL).title(WINDOW_TITLE),
        layout.window,
    );

    draw_banner(f, layout.banner, state, page);

    let content_block = Block::default()
        .borders(Borders::ALL)
        .title(page_title(page));
    let content = Paragraph::new(page_text(state, page))
        .block(content_block)
        .alignment(Alignment::Left)
        .wrap(Wrap { trim: false });
    f.render_widget(content, layout.content);

    if let Some(status) = state.status.as_ref() {
        let (text, style) = match status {
            Status::Info(t) => (t.as_str(), Style::default().fg(Color::Cyan)),
            Status::Error(t) => (t.as_str(), Style::default().fg(Color::Red)),
        };
        f.render_widget(
            Paragraph::new(Line::from(Span::styled(text.to_string(), style))),
            layout.status,
        );
    }

    draw_buttons(f, layout.buttons, state, page);

    match state.modal.as_ref() {
        Some(Modal::ConfirmCancel { yes }) => draw_cancel_modal(f, layout.window, *yes),
        Some(Modal::Message { title, body }) => draw_message_modal(f, layout.window, title, body),
        None => {}
    }
}

fn draw_banner(f: &mut Frame<'_>, area: Rect, state: &WizardState, page: Page) {
    let mut lines: Vec<Line> = LOGO.lines().map(|l| Line::from(l.to_string())).collect();
    lines.push(Line::from(""));
    for step in state.controller.steps() {
        let current = Page::for_step(step.id()) == page;
        let mark = if current {
            ">"
        } else if state.controller.answers().contains(step.id()) {
            "+"
        } else {
            " "
        };
        let style = if current {
            Style::default().add_modifier(Modifier::BOLD)
        } else {
            Style::default()
        };
        lines.push(Line::from(Span::styled(
            format!(" {} {}", mark, step.prompt().title),
            style,
        )));
    }
    let banner = Paragraph::new(Text::from(lines))
        .block(Block::default().borders(Borders::ALL))
        .wrap(Wrap { trim: false });
    f.render_widget(banner, area);
}

/// Log view shown while the rebuild runs; drawn from the output lines only.
fn draw_applying(f: &mut Frame<'_>, area: Rect, log: &[String], attempt: u32) {
    let layout = window_layout(area);
    f.render_widget(
        Block::default().borders(Borders::ALL).title(WINDOW_TITLE),
        layout.window,
    );
    let banner = Paragraph::new(LOGO).block(Block::default().borders(Borders::ALL));
    f.render_widget(banner, layout.banner);

    let visible = layout.content.height.saturating_sub(2) as usize;
    let mut lines: Vec<Line> = log
        .iter()
        .skip(log.len().saturating_sub(visible))
        .map(|l| Line::from(l.clone()))
        .collect();
    if lines.is_empty() {
        lines.push(Line::from("(waiting for output)"));
    }
    let content = Paragraph::new(Text::from(lines)).block(
        Block::default()
            .borders(Borders::ALL)
            .title(format!("{} (attempt {})", page_title(Page::Applying), attempt)),
    );
    f.render_widget(content, layout.content);
    f.render_widget(
        Paragraph::new("Rebuilding the system; this can take a while. Cancel is not available."),
        layout.status,
    );
}

fn centered_window(area: Rect, width: u16, height: u16) -> Rect {
    let w = width.min(area.width.saturating_sub(2)).max(60).min(area.width);
    let h = height.min(area.height.saturating_sub(2)).max(20).min(area.height);
    let x = area.x + (area.width.saturating_sub(w)) / 2;
    let y = area.y + (area.height.saturating_sub(h)) / 2;
    Rect {
        x,
        y,
        width: w,
        height: h,
    }
}

fn draw_buttons(f: &mut Frame<'_>, area: Rect, state: &WizardState, page: Page) {
    let back = button_text(
        "Back",
        state.focus == FocusTarget::Button(ButtonFocus::Back),
        can_go_back(page),
    );
    let next = button_text(
        next_label(page),
        state.focus == FocusTarget::Button(ButtonFocus::Next),
        page != Page::Applying,
    );
    let cancel = button_text(
        "Cancel",
        state.focus == FocusTarget::Button(ButtonFocus::Cancel),
        can_cancel(page),
    );

    let line = Line::from(vec![back, Span::raw(" "), next, Span::raw(" "), cancel]);
    let p = Paragraph::new(Text::from(line)).alignment(Alignment::Right);
    f.render_widget(p, area);
}

fn button_text(label: &str, focused: bool, enabled: bool) -> Span<'static> {
    let mut style = Style::default();
    if !enabled {
        style = style.fg(Color::DarkGray);
    }
    if focused && enabled {
        style = style.add_modifier(Modifier::REVERSED);
    }
    Span::styled(format!("[ {} ]", label), style)
}

fn modal_area(window_area: Rect, width: u16, height: u16) -> Rect {
    let w = width.min(window_area.width.saturating_sub(4)).max(40);
    let h = height.min(window_area.height.saturating_sub(4)).max(7);
    Rect {
        x: window_area.x + (window_area.width.saturating_sub(w)) / 2,
        y: window_area.y + (window_area.height.saturating_sub(h)) / 2,
        width: w,
        height: h,
    }
}

fn draw_cancel_modal(f: &mut Frame<'_>, window_area: Rect, yes_focused: bool) {
    let area = modal_area(window_area, 56, 7);
    f.render_widget(Clear, area);

    let body = Paragraph::new(Text::from(vec![
        Line::from("Nothing has been applied yet; your answers will be lost."),
        Line::from(""),
    ]))
    .block(Block::default().borders(Borders::ALL).title("Cancel setup?"))
    .wrap(Wrap { trim: false });
    f.render_widget(body, area);

    let buttons_area = Rect {
        x: area.x + 1,
        y: area.y + area.height - 2,
        width: area.width - 2,
        height: 1,
    };
    let focused = Style::default().add_modifier(Modifier::REVERSED);
    let yes = Span::styled(
        "[ Yes, cancel ]",
        if yes_focused { focused } else { Style::default() },
    );
    let no = Span::styled(
        "[ No ]",
        if yes_focused { Style::default() } else { focused },
    );
    let line = Line::from(vec![yes, Span::raw(" "), no]);
    f.render_widget(
        Paragraph::new(Text::from(line)).alignment(Alignment::Right),
        buttons_area,
    );
}

fn draw_message_modal(f: &mut Frame<'_>, window_area: Rect, title: &str, body: &str) {
    let area = modal_area(window_area, 70, 10);
    f.render_widget(Clear, area);
    let p = Paragraph::new(Text::from(body.to_string()))
        .block(Block::default().borders(Borders::ALL).title(title.to_string()))
        .wrap(Wrap { trim: false });
    f.render_widget(p, area);

    let buttons_area = Rect {
        x: area.x + 1,
        y: area.y + area.height - 2,
        width: area.width - 2,
        height: 1,
    };
    let ok = Span::styled("[ OK ]", Style::default().add_modifier(Modifier::REVERSED));
    f.render_widget(
        Paragraph::new(Line::from(vec![ok])).alignment(Alignment::Right),
        buttons_area,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sample_key, sandbox_settings};
    use crate::wizard::steps::default_steps;

    fn state(root: &std::path::Path) -> WizardState {
        let settings = sandbox_settings(root, "true");
        let steps = default_steps(&settings, vec!["UTC".into(), "Europe/Zurich".into()]);
        WizardState::new(Controller::open(&settings, steps, false))
    }

    fn runtime() -> Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime")
    }

    fn buffer_text(buffer: &ratatui::buffer::Buffer) -> String {
        let area = buffer.area;
        let mut out = String::new();
        for y in area.y..area.y + area.height {
            for x in area.x..area.x + area.width {
                out.push_str(buffer.get(x, y).symbol());
            }
            out.push('\n');
        }
        out
    }

    fn type_text(state: &mut WizardState, text: &str) {
        for c in text.chars() {
            handle_key(state, KeyCode::Char(c));
        }
    }

    #[test]
    fn every_page_renders() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let state = state(tmp.path());
        for page in Page::ALL {
            let buffer = render_to_buffer(&state, page, 100, 30).expect("render");
            let text = buffer_text(&buffer);
            assert!(text.contains(WINDOW_TITLE), "{:?}", page);
            let title = page_title(page);
            assert!(text.contains(title), "{:?} missing title {}", page, title);
        }
        // Small terminals must not panic.
        render_to_buffer(&state, Page::Review, 40, 10).expect("small");
    }

    #[test]
    fn smoke_slugs_round_trip() {
        for page in Page::ALL {
            assert_eq!(Page::from_slug(page.slug()), Some(page));
        }
        assert_eq!(Page::from_slug(" Review "), Some(Page::Review));
        assert_eq!(Page::from_slug("nope"), None);
    }

    #[test]
    fn masked_input_never_renders_the_secret() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut state = state(tmp.path());
        state.runner_token.set("ghp_SUPERSECRET");
        state.wifi_psk.set("correct horse");
        let runner = buffer_text(&render_to_buffer(&state, Page::Runner, 100, 30).expect("render"));
        let wifi = buffer_text(&render_to_buffer(&state, Page::Wifi, 100, 30).expect("render"));
        assert!(!runner.contains("SUPERSECRET"));
        assert!(runner.contains("***************"));
        assert!(!wifi.contains("horse"));
    }

    #[test]
    fn text_input_handles_multibyte_characters() {
        let mut input = TextInput::new("Zürich", false);
        input.handle_key(KeyCode::Left);
        input.handle_key(KeyCode::Backspace);
        assert_eq!(input.value, "Zürih");
        input.handle_key(KeyCode::Home);
        input.handle_key(KeyCode::Delete);
        input.handle_key(KeyCode::Char('Z'));
        assert_eq!(input.value, "Zürih");
    }

    #[test]
    fn keyboard_walk_reaches_review() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let rt = runtime();
        let mut state = state(tmp.path());

        assert_eq!(handle_key(&mut state, KeyCode::Enter), UiEffect::None);
        assert_eq!(state.page(), Page::SshKey);

        // Paste one key through the source field.
        handle_key(&mut state, KeyCode::BackTab);
        handle_key(&mut state, KeyCode::Right);
        assert_eq!(state.key_source, KeySource::Paste);
        handle_key(&mut state, KeyCode::Tab);
        type_text(&mut state, &sample_key("ssh-ed25519", 9, "tui"));
        assert_eq!(handle_key(&mut state, KeyCode::Enter), UiEffect::FetchKeys);
        add_keys(&mut state, &rt);
        assert_eq!(state.keys.len(), 1);
        assert!(state.key_input.value.is_empty());

        // Empty source field moves on.
        handle_key(&mut state, KeyCode::Enter);
        assert_eq!(state.page(), Page::Runner);

        // Empty token skips the runner.
        for _ in 0..4 {
            handle_key(&mut state, KeyCode::Enter);
        }
        assert_eq!(state.page(), Page::Hostname);

        for _ in 0.."pi4-smoke-test".len() {
            handle_key(&mut state, KeyCode::Backspace);
        }
        type_text(&mut state, "lab-pi");
        handle_key(&mut state, KeyCode::Enter);
        assert_eq!(state.page(), Page::Timezone);

        type_text(&mut state, "zur");
        handle_key(&mut state, KeyCode::Enter);
        assert_eq!(state.timezone.value, "Europe/Zurich");
        handle_key(&mut state, KeyCode::Enter);
        assert_eq!(state.page(), Page::Wifi);

        handle_key(&mut state, KeyCode::Enter);
        handle_key(&mut state, KeyCode::Enter);
        assert_eq!(state.page(), Page::Review);
        assert_eq!(state.controller.answers().hostname(), Some("lab-pi"));
        assert_eq!(state.controller.answers().timezone(), Some("Europe/Zurich"));
        assert!(state.controller.answers().runner().is_none());

        assert_eq!(handle_key(&mut state, KeyCode::Enter), UiEffect::Submit);
    }

    #[test]
    fn invalid_hostname_stays_on_page_with_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut state = state(tmp.path());
        handle_key(&mut state, KeyCode::Enter);
        handle_key(&mut state, KeyCode::Enter);
        for _ in 0..4 {
            handle_key(&mut state, KeyCode::Enter);
        }
        assert_eq!(state.page(), Page::Hostname);
        type_text(&mut state, "_bad");
        handle_key(&mut state, KeyCode::Enter);
        assert_eq!(state.page(), Page::Hostname);
        assert!(matches!(state.status, Some(Status::Error(_))));
    }

    #[test]
    fn cancel_requires_confirmation() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut state = state(tmp.path());
        handle_key(&mut state, KeyCode::Enter);

        handle_key(&mut state, KeyCode::Esc);
        assert_eq!(state.modal, Some(Modal::ConfirmCancel { yes: false }));
        handle_key(&mut state, KeyCode::Enter);
        assert!(state.modal.is_none());
        assert!(!state.quit);
        assert_eq!(state.page(), Page::SshKey);

        handle_key(&mut state, KeyCode::Esc);
        handle_key(&mut state, KeyCode::Left);
        handle_key(&mut state, KeyCode::Enter);
        assert!(state.quit);
        assert_eq!(state.controller.phase(), Phase::Aborted);
        assert_eq!(state.exit_code(), exit_code::FAILED);
    }

    #[test]
    fn submit_through_test_backend_reaches_done() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let settings = sandbox_settings(tmp.path(), "echo switching; echo done >&2");
        let steps = default_steps(&settings, vec!["UTC".into()]);
        let mut state = WizardState::new(Controller::open(&settings, steps, false));
        let rt = runtime();
        let mut terminal = Terminal::new(TestBackend::new(100, 30)).expect("terminal");

        handle_key(&mut state, KeyCode::Enter);
        while state.page() != Page::Review {
            state.focus = FocusTarget::Button(ButtonFocus::Next);
            handle_key(&mut state, KeyCode::Enter);
        }
        assert_eq!(handle_key(&mut state, KeyCode::Enter), UiEffect::Submit);
        submit(&mut terminal, &mut state, &rt).expect("submit");

        assert_eq!(state.page(), Page::Done);
        let mut log = state.apply_log.clone();
        log.sort();
        assert_eq!(log, vec!["! done".to_string(), "switching".to_string()]);
        assert!(state.controller.gate().is_set());
        assert_eq!(state.exit_code(), exit_code::OK);

        handle_key(&mut state, KeyCode::Enter);
        assert!(state.quit);
    }

    #[test]
    fn runner_token_input_is_cleared_once_written() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let settings = sandbox_settings(tmp.path(), "true");
        let steps = default_steps(&settings, vec!["UTC".into()]);
        let mut state = WizardState::new(Controller::open(&settings, steps, false));
        let rt = runtime();
        let mut terminal = Terminal::new(TestBackend::new(100, 30)).expect("terminal");

        handle_key(&mut state, KeyCode::Enter);
        while state.page() != Page::Review {
            if state.page() == Page::Runner {
                state.runner_token.set("RUNNERTOKEN0001");
            }
            state.focus = FocusTarget::Button(ButtonFocus::Next);
            handle_key(&mut state, KeyCode::Enter);
        }
        assert_eq!(state.runner_token.value, "RUNNERTOKEN0001");

        assert_eq!(handle_key(&mut state, KeyCode::Enter), UiEffect::Submit);
        submit(&mut terminal, &mut state, &rt).expect("submit");

        assert_eq!(state.page(), Page::Done);
        assert!(state.runner_token.value.is_empty());
        assert_eq!(
            std::fs::read(&settings.runner.token_file).expect("token file"),
            b"RUNNERTOKEN0001"
        );
    }

    #[test]
    fn failed_rebuild_shows_hint_and_retry_resubmits() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let settings = sandbox_settings(tmp.path(), "echo 'error: boom' >&2; exit 1");
        let steps = default_steps(&settings, vec!["UTC".into()]);
        let mut state = WizardState::new(Controller::open(&settings, steps, false));
        let rt = runtime();
        let mut terminal = Terminal::new(TestBackend::new(100, 30)).expect("terminal");

        handle_key(&mut state, KeyCode::Enter);
        while state.page() != Page::Review {
            state.focus = FocusTarget::Button(ButtonFocus::Next);
            handle_key(&mut state, KeyCode::Enter);
        }
        handle_key(&mut state, KeyCode::Enter);
        submit(&mut terminal, &mut state, &rt).expect("submit");
        assert_eq!(state.page(), Page::Failed);

        let text = buffer_text(&render_to_buffer(&state, Page::Failed, 100, 30).expect("render"));
        assert!(text.contains("Manual command: sudo sh -c"));
        assert!(text.contains("error: boom"));

        assert_eq!(handle_key(&mut state, KeyCode::Enter), UiEffect::Submit);
        assert_eq!(state.page(), Page::Review);
    }

    #[test]
    fn failed_page_shows_only_the_last_diagnostic_lines() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let script = "for i in 01 02 03 04 05 06 07 08 09 10 11 12 13 14 15 16 17 18 19 20; do echo \"diag-$i\" >&2; done; exit 1";
        let settings = sandbox_settings(tmp.path(), script);
        let steps = default_steps(&settings, vec!["UTC".into()]);
        let mut state = WizardState::new(Controller::open(&settings, steps, false));
        let rt = runtime();
        let mut terminal = Terminal::new(TestBackend::new(100, 40)).expect("terminal");

        handle_key(&mut state, KeyCode::Enter);
        while state.page() != Page::Review {
            state.focus = FocusTarget::Button(ButtonFocus::Next);
            handle_key(&mut state, KeyCode::Enter);
        }
        handle_key(&mut state, KeyCode::Enter);
        submit(&mut terminal, &mut state, &rt).expect("submit");
        assert_eq!(state.page(), Page::Failed);

        let text = buffer_text(&render_to_buffer(&state, Page::Failed, 100, 40).expect("render"));
        assert!(text.contains("diag-20"));
        assert!(text.contains("diag-09"));
        assert!(!text.contains("diag-08"));
        assert!(!text.contains("diag-01"));
    }
}
