use env_logger::{Env, TimestampPrecision};
use snapfork::{boot, config::Config};
use std::{path::PathBuf, time::Duration};
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "snapfork", about = "Forkserver front for snapshot-restored targets.")]
struct Settings {
    /// Target executable.
    #[structopt(long, short = "t")]
    target: PathBuf,
    /// Working directory of the target, receives the info file.
    #[structopt(long, short = "p", default_value = "./")]
    project: PathBuf,
    /// Input file used when the fuzzer does not share its input map.
    #[structopt(long, short = "i")]
    input: Option<PathBuf>,
    /// Coverage map size, a power of two.
    #[structopt(long, default_value = "65536")]
    map_size: usize,
    /// Largest input handed to the target.
    #[structopt(long, default_value = "1048576")]
    max_input: usize,
    /// Payload capacity of the data channel.
    #[structopt(long, default_value = "1048576")]
    dio_size: usize,
    /// Per-run timeout in milliseconds, none if unset.
    #[structopt(long)]
    timeout_ms: Option<u64>,
    /// Forkserver control descriptor.
    #[structopt(long, default_value = "198")]
    ctl_fd: i32,
    /// Bound on pipe retransmissions inside the target.
    #[structopt(long)]
    pipe_retries: Option<u64>,
    /// Pipe debug mask inside the target.
    #[structopt(long, default_value = "0")]
    pipe_debug: u32,
    /// Attempts at bringing a lost target back.
    #[structopt(long, default_value = "3")]
    respawn: u32,
    /// Arguments passed to the target.
    #[structopt(last = true)]
    args: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    let settings = Settings::from_args();

    let log_env = Env::new()
        .filter_or("SNAPFORK_LOG", "info")
        .default_write_style_or("auto");
    env_logger::Builder::from_env(log_env)
        .format_timestamp(Some(TimestampPrecision::Seconds))
        .init();

    let config = Config {
        target: settings.target,
        target_args: settings.args,
        project: settings.project,
        input: settings.input,
        map_size: settings.map_size,
        max_input: settings.max_input,
        dio_size: settings.dio_size,
        timeout: settings.timeout_ms.map(Duration::from_millis),
        ctl_fd: settings.ctl_fd,
        pipe_retries: settings.pipe_retries,
        pipe_debug: settings.pipe_debug,
        respawn: settings.respawn,
    };

    boot(config)
}
