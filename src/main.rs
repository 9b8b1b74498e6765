use clap::{Parser, ValueEnum};
use secrecy::SecretString;
use setup_tool::error::exit_code;
use setup_tool::headless::{HeadlessAnswers, KeyMethod};
use setup_tool::settings::WizardSettings;
use std::path::PathBuf;

/// First-boot configuration wizard for NixOS devices
#[derive(Parser, Debug)]
#[command(name = "setup-tool")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Settings file (default: /etc/setup-tool/settings.toml when present)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Run even if the device is already configured
    #[arg(long)]
    force: bool,

    /// Take answers from the flags below instead of the console wizard
    #[arg(long)]
    non_interactive: bool,

    /// Print the systemd unit that runs the wizard at boot, then exit
    #[arg(long)]
    print_unit: bool,

    /// Remove the completion marker so the wizard runs again, then exit
    #[arg(long)]
    reset: bool,

    /// Render one wizard page off-screen and exit
    #[arg(long, value_name = "PAGE", num_args = 0..=1, default_missing_value = "welcome")]
    tui_smoke: Option<String>,

    /// SSH public key, account name or key file (see --ssh-method)
    #[arg(long)]
    ssh_key: Option<String>,

    /// How to read --ssh-key
    #[arg(long, value_enum, default_value_t = SshMethod::Direct)]
    ssh_method: SshMethod,

    /// Runner registration token
    #[arg(long, env = "SETUP_TOOL_RUNNER_TOKEN", hide_env_values = true)]
    runner_token: Option<String>,

    /// Runner registration URL, or absolute path to a file holding it
    #[arg(long)]
    runner_url: Option<String>,

    #[arg(long)]
    runner_name: Option<String>,

    /// Comma separated runner labels
    #[arg(long)]
    runner_labels: Option<String>,

    /// Do not configure the CI runner
    #[arg(long)]
    skip_runner: bool,

    #[arg(long)]
    hostname: Option<String>,

    #[arg(long)]
    timezone: Option<String>,

    #[arg(long)]
    wifi_ssid: Option<String>,

    #[arg(long, env = "SETUP_TOOL_WIFI_PSK", hide_env_values = true)]
    wifi_password: Option<String>,

    /// Disable WiFi
    #[arg(long)]
    skip_wifi: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SshMethod {
    /// Fetch `<account>.keys` from the key endpoint
    Github,
    /// The key line itself
    Direct,
    /// Read keys from a file
    File,
}

impl Cli {
    fn headless_answers(&mut self) -> HeadlessAnswers {
        HeadlessAnswers {
            ssh_key: self.ssh_key.take(),
            ssh_method: match self.ssh_method {
                SshMethod::Github => KeyMethod::Github,
                SshMethod::Direct => KeyMethod::Direct,
                SshMethod::File => KeyMethod::File,
            },
            runner_token: self.runner_token.take().map(SecretString::from),
            runner_url: self.runner_url.take(),
            runner_name: self.runner_name.take(),
            runner_labels: self.runner_labels.take(),
            skip_runner: self.skip_runner,
            hostname: self.hostname.take(),
            timezone: self.timezone.take(),
            wifi_ssid: self.wifi_ssid.take(),
            wifi_password: self.wifi_password.take().map(SecretString::from),
            skip_wifi: self.skip_wifi,
        }
    }
}

fn main() {
    let mut cli = Cli::parse();

    let settings = match WizardSettings::load(cli.config.as_deref()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("setup-tool: {:#}", e);
            std::process::exit(exit_code::ENVIRONMENT);
        }
    };

    if cli.print_unit {
        print!("{}", setup_tool::unit_text(&settings, None));
        return;
    }

    if let Some(page) = cli.tui_smoke.take() {
        std::process::exit(setup_tool::run_tui_smoke(&settings, Some(page)));
    }

    let preflight = if cli.reset {
        setup_tool::check_privileges(&settings).map(|()| false)
    } else {
        setup_tool::preflight(&settings, cli.force)
    };
    match preflight {
        Ok(true) => std::process::exit(exit_code::OK),
        Ok(false) => {}
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(e.exit_code());
        }
    }

    let code = if cli.reset {
        setup_tool::reset(&settings)
    } else if cli.non_interactive {
        let answers = cli.headless_answers();
        setup_tool::run_non_interactive(&settings, answers, cli.force)
    } else {
        setup_tool::run_tui(&settings, cli.force)
    };
    std::process::exit(code);
}
