use std::path::Path;

use clap::Parser;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tempfile::TempDir;

// The CLI shares the process-wide link registry, so each test uses its own device.
const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";
const PAIRING_NOTIFICATIONS: &str =
    "00000f0101aabbccddeeff000000000000000000,00001fffab12ab12ab12ab12ab12ab1200000000";

#[derive(Debug, Default)]
struct FakeTerminalClient;

impl microbot::TerminalClient for FakeTerminalClient {
    fn stdout_is_terminal(&self) -> bool {
        false
    }

    fn stderr_is_terminal(&self) -> bool {
        false
    }
}

async fn run_with_parsed_args(args: microbot::Args) -> anyhow::Result<String> {
    let mut output = Vec::new();
    let log_level = args.log_level();
    let settings = args.run_settings();
    let (command, maybe_fake_args) = args.into_command_and_fake_args();
    let hardware_client = match maybe_fake_args {
        Some(fake_args) => microbot::fake_hardware_client(fake_args).await?,
        None => microbot::real_hardware_client().await?,
    };
    microbot::run_with_clients_and_log_level(
        command,
        &mut output,
        &FakeTerminalClient,
        hardware_client,
        settings,
        log_level,
    )
    .await?;
    Ok(String::from_utf8(output)?)
}

async fn run_with_argv(store: &Path, argv: &[&str]) -> anyhow::Result<String> {
    let store = store.to_str().expect("temporary path should be UTF-8");
    let mut full = vec!["microbot", "--token-store", store, "--fake"];
    full.extend_from_slice(argv);
    let parsed_args = microbot::Args::try_parse_from(full)?;
    run_with_parsed_args(parsed_args).await
}

fn json_output(stdout: &str) -> Value {
    serde_json::from_str(stdout).expect("stdout should hold one JSON document")
}

#[tokio::test]
async fn token_command_reports_missing_token_as_json() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = dir.path().join("tokens.conf");

    let stdout = run_with_argv(&store, &["token", "AA:BB:CC:DD:EE:01"]).await?;

    assert_eq!(
        json!({
            "command": "token",
            "address": "aabbccddee01",
            "stored": false,
            "token_store": store,
        }),
        json_output(&stdout)
    );
    Ok(())
}

#[tokio::test]
async fn pair_then_push_uses_the_stored_token() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = dir.path().join("tokens.conf");

    let paired = run_with_argv(
        &store,
        &["--fake-notifications", PAIRING_NOTIFICATIONS, "pair", ADDRESS],
    )
    .await?;
    assert_eq!("pair", json_output(&paired)["command"]);
    let contents = std::fs::read_to_string(&store)?;
    assert!(contents.contains("[tokens]"));
    assert!(contents.contains("aabbccddeeff = ab12ab12ab12ab12ab12ab1200000000"));

    let pushed = run_with_argv(&store, &["push", ADDRESS, "off"]).await?;
    assert_eq!(
        json!({
            "command": "push",
            "address": "aabbccddeeff",
            "state": "off",
            "is_on": false,
        }),
        json_output(&pushed)
    );
    Ok(())
}

#[tokio::test]
async fn push_without_token_asks_for_pairing() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = dir.path().join("tokens.conf");

    let error = run_with_argv(&store, &["push", "AA:BB:CC:DD:EE:02", "on"])
        .await
        .expect_err("push without a stored token should fail");

    assert!(format!("{error:#}").contains("pair the device first"));
    Ok(())
}

#[tokio::test]
async fn calibrate_prints_pretty_summary() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = dir.path().join("tokens.conf");
    std::fs::write(
        &store,
        "[tokens]\naabbccddee03 = ab12ab12ab12ab12ab12ab1200000000\n",
    )?;

    let stdout = run_with_argv(
        &store,
        &[
            "--output-format",
            "pretty",
            "calibrate",
            "AA:BB:CC:DD:EE:03",
            "--depth",
            "75",
            "--duration",
            "500",
            "--mode",
            "invert",
        ],
    )
    .await?;

    assert_eq!(
        "✓ Calibrated aabbccddee03: depth 75%, duration 500, mode invert",
        stdout.trim_end()
    );
    Ok(())
}

#[test]
fn invalid_notification_fixture_is_rejected() {
    let result = microbot::FakeArgs::builder().notifications("0f0");
    assert!(matches!(
        result,
        Err(microbot::FixtureError::InvalidHexLength)
    ));
}

#[test]
fn address_without_hex_digits_is_rejected() {
    let result = microbot::Args::try_parse_from(["microbot", "token", "::"]);
    let error = result.expect_err("an address with no digits should not parse");
    assert_eq!(clap::error::ErrorKind::ValueValidation, error.kind());
}
