// setup-tool: first-boot configuration wizard
// Library entry point

pub mod error;
pub mod headless;
pub mod installation;
pub mod models;
pub mod security;
pub mod settings;
pub mod tui;
pub mod utils;
pub mod wizard;

#[cfg(test)]
pub(crate) mod test_support;

use error::{exit_code, WizardError};
use headless::HeadlessAnswers;
use installation::gate::CompletionGate;
use installation::{service, OutputLine, OutputStream};
use log::{error, info, warn};
use settings::WizardSettings;
use std::path::{Path, PathBuf};
use std::time::Duration;
use wizard::steps::{default_steps, timezone};
use wizard::Controller;

/// Initialize logging with dual format (JSON + human-readable).
///
/// Returns the folder the log files were created in.
pub fn init_logging(log_dir: &Path, with_stdout: bool) -> anyhow::Result<PathBuf> {
    let log_dir = utils::path_resolver::resolve_log_folder(log_dir)?;

    let timestamp = chrono::Utc::now().format("%Y-%m-%d-%H%M%S");

    // JSON log file for structured parsing
    let json_log_file = log_dir.join(format!("setup-tool-{}.log", timestamp));

    // Human-readable log file (.txt)
    let txt_log_file = log_dir.join(format!("setup-tool-{}.txt", timestamp));

    // stdout stays off while the console wizard owns the terminal.
    let mut dispatch = fern::Dispatch::new().level(log::LevelFilter::Debug);

    if with_stdout {
        dispatch = dispatch.chain(
            fern::Dispatch::new()
                .level(log::LevelFilter::Info)
                .format(move |out, message, record| {
                    let timestamp_local = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
                    let message_str = format!("{}", message);
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let txt_line = utils::logging::format_human_readable_log(
                        &timestamp_local.to_string(),
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                    );
                    out.finish(format_args!("{}", txt_line));
                })
                .chain(std::io::stdout()),
        );
    }

    dispatch = dispatch
        .chain(
            fern::Dispatch::new()
                .format(move |out, message, record| {
                    let timestamp_utc = chrono::Utc::now().to_rfc3339();
                    let message_str = format!("{}", message);
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let json_line = utils::logging::format_json_log(
                        &timestamp_utc,
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                        None,
                    );
                    out.finish(format_args!("{}\n", json_line));
                })
                .chain(fern::log_file(json_log_file)?),
        )
        .chain(
            fern::Dispatch::new()
                .format(move |out, message, record| {
                    let timestamp_local = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
                    let message_str = format!("{}", message);
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let txt_line = utils::logging::format_human_readable_log(
                        &timestamp_local.to_string(),
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                    );
                    out.finish(format_args!("{}\n", txt_line));
                })
                .chain(fern::log_file(txt_log_file)?),
        );

    dispatch.apply()?;

    log::info!(
        "[PHASE: initialization] Logging initialized, log directory: {:?}",
        log_dir
    );
    Ok(log_dir)
}

/// Current-thread runtime; every await in the wizard is sequential.
pub fn build_runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?)
}

/// Open a session with the full step sequence.
fn open_session(
    settings: &WizardSettings,
    rt: &tokio::runtime::Runtime,
    force: bool,
) -> Controller {
    let zones = rt.block_on(timezone::load_timezones());
    Controller::open(settings, default_steps(settings, zones), force)
}

fn start_logging(settings: &WizardSettings, with_stdout: bool) {
    if let Err(e) = init_logging(&settings.paths.log_dir, with_stdout) {
        eprintln!("Failed to initialize logging: {}", e);
    }
    info!(
        "[PHASE: initialization] setup-tool {} starting at {}",
        env!("CARGO_PKG_VERSION"),
        chrono::Utc::now()
    );
}

/// The completion marker exists and `--force` was not given.
pub fn already_configured(settings: &WizardSettings, force: bool) -> bool {
    !force && CompletionGate::new(&settings.paths.marker).is_set()
}

fn print_already_configured(settings: &WizardSettings) {
    println!(
        "Already configured ({} exists). Use --force to run the wizard again.",
        settings.paths.marker.display()
    );
}

/// Checks made before a wizard run touches anything.
///
/// Returns `Ok(true)` when the device is already configured; that wins over
/// the root requirement so a configured device exits cleanly for any user.
pub fn preflight(settings: &WizardSettings, force: bool) -> Result<bool, WizardError> {
    if already_configured(settings, force) {
        print_already_configured(settings);
        return Ok(true);
    }
    check_privileges(settings)?;
    Ok(false)
}

/// Interactive console wizard. Returns the process exit code.
pub fn run_tui(settings: &WizardSettings, force: bool) -> i32 {
    if already_configured(settings, force) {
        print_already_configured(settings);
        return exit_code::OK;
    }
    start_logging(settings, false);

    let rt = match build_runtime() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start runtime: {}", e);
            return exit_code::ENVIRONMENT;
        }
    };

    let controller = open_session(settings, &rt, force);

    match tui::run(controller, &rt) {
        Ok(code) => {
            info!("[PHASE: tui] [STEP: exit] wizard finished (exit_code={})", code);
            code
        }
        Err(e) => {
            error!("[PHASE: tui] [STEP: fatal] TUI exited with error: {:?}", e);
            eprintln!("setup-tool: terminal error: {}", e);
            exit_code::ENVIRONMENT
        }
    }
}

/// Answers from flags, same controller, spinner with streamed rebuild output.
pub fn run_non_interactive(settings: &WizardSettings, answers: HeadlessAnswers, force: bool) -> i32 {
    if already_configured(settings, force) {
        print_already_configured(settings);
        return exit_code::OK;
    }
    start_logging(settings, false);

    let rt = match build_runtime() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start runtime: {}", e);
            return exit_code::ENVIRONMENT;
        }
    };

    let mut controller = open_session(settings, &rt, force);

    if let Err(e) = rt.block_on(answers.fill(&mut controller)) {
        eprintln!("setup-tool: {}", e);
        return e.exit_code();
    }

    println!("Applying:");
    for (id, text) in controller.answers().summary() {
        println!("  {:<10} {}", id.as_str(), text);
    }

    let pb = indicatif::ProgressBar::new_spinner();
    pb.set_style(
        indicatif::ProgressStyle::with_template("{spinner} {elapsed_precise} {msg}")
            .unwrap_or_else(|_| indicatif::ProgressStyle::default_spinner()),
    );
    pb.enable_steady_tick(Duration::from_millis(120));
    pb.set_message("rebuilding system");

    let result = rt.block_on(controller.submit(|line: OutputLine| match line.stream {
        OutputStream::Stdout => pb.println(line.text),
        OutputStream::Stderr => pb.println(format!("! {}", line.text)),
    }));

    match result {
        Ok(report) => {
            pb.finish_with_message(format!(
                "configuration applied in {}s",
                report.duration_ms / 1000
            ));
            exit_code::OK
        }
        Err(e) => {
            pb.abandon_with_message("failed");
            eprintln!("setup-tool: {}", e);
            if let Some(failure) = controller.last_failure() {
                if let Some(hint) = failure.manual_hint.as_ref() {
                    eprintln!("Retry manually with: {}", hint);
                }
            }
            e.exit_code()
        }
    }
}

/// Render a single TUI frame for `target` and exit (automated checks).
pub fn run_tui_smoke(settings: &WizardSettings, target: Option<String>) -> i32 {
    start_logging(settings, false);

    let target = target.as_deref().unwrap_or("welcome");
    let steps = default_steps(
        settings,
        timezone::FALLBACK_TIMEZONES
            .iter()
            .map(|z| z.to_string())
            .collect(),
    );
    let controller = Controller::open(settings, steps, true);
    match tui::smoke(controller, target) {
        Ok(()) => exit_code::OK,
        Err(e) => {
            error!(
                "[PHASE: tui] [STEP: smoke] TUI smoke exited with error: {:?}",
                e
            );
            eprintln!("setup-tool: {}", e);
            exit_code::FAILED
        }
    }
}

/// Remove the completion marker so the wizard runs on next boot.
pub fn reset(settings: &WizardSettings) -> i32 {
    start_logging(settings, false);
    match CompletionGate::new(&settings.paths.marker).clear() {
        Ok(true) => {
            println!("Removed {}", settings.paths.marker.display());
            exit_code::OK
        }
        Ok(false) => {
            println!("{} does not exist", settings.paths.marker.display());
            exit_code::OK
        }
        Err(e) => {
            eprintln!("setup-tool: {}", e);
            e.exit_code()
        }
    }
}

/// systemd unit that runs `exec_path` on the console until the marker exists.
pub fn unit_text(settings: &WizardSettings, exec_path: Option<&Path>) -> String {
    let exec_path = exec_path
        .map(Path::to_path_buf)
        .or_else(|| std::env::current_exe().ok())
        .unwrap_or_else(|| PathBuf::from("/run/current-system/sw/bin/setup-tool"));
    service::build_systemd_unit_text(&exec_path, &settings.paths.marker)
}

/// Refuse to run without root when the settings require it.
pub fn check_privileges(settings: &WizardSettings) -> Result<(), WizardError> {
    if !settings.wizard.require_root {
        return Ok(());
    }
    if is_root() {
        Ok(())
    } else {
        warn!("[PHASE: initialization] not running as root");
        Err(WizardError::InvalidState(
            "setup-tool must run as root (try: sudo setup-tool)".to_string(),
        ))
    }
}

#[cfg(unix)]
fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(unix))]
fn is_root() -> bool {
    false
}
