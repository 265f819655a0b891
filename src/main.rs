use std::process::ExitCode;

use clap::Parser;

use microbot::{Args, fake_hardware_client, real_hardware_client, run_with_log_level};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let mut stdout = std::io::stdout();

    let run_result = async {
        let log_level = args.log_level();
        let settings = args.run_settings();
        let (command, maybe_fake_args) = args.into_command_and_fake_args();
        let hardware_client = match maybe_fake_args {
            Some(fake_args) => fake_hardware_client(fake_args).await?,
            None => real_hardware_client().await?,
        };

        run_with_log_level(command, &mut stdout, hardware_client, settings, log_level).await
    }
    .await;

    match run_result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(1)
        }
    }
}
