use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "rcp",
    version,
    about = "Stream a file over TCP with live read, write and buffer throughput monitoring",
    long_about = "`rcp` moves one byte stream between two endpoints over TCP, using a pool of buffers between the reading and the writing side so that neither has to wait for the other.

Read and write speeds and buffer usage are sampled every second and can be shown as a live dashboard. Synthetic input (--dummy-input) and discarded output (--dummy-output) make it possible to measure network and storage performance separately.

A transfer takes two steps: listen on the receiving side, then dial from the sending side.

EXAMPLES:
    # Listen on TCP port 1987 and save what arrives
    rcp listen -l :1987 -o save_filename

    # Send a file to the listener
    rcp send -d 10.10.10.10:1987 -i input_filename --progress

    # Measure network throughput with 10GiB of zeros, discarding them on arrival
    rcp listen --dummy-output
    rcp send -d 10.10.10.10:1987 --dummy-input 10GiB

    # Measure local disk read throughput
    rcp send -i input_filename --dummy-output"
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    // Buffering
    /// Maximum number of buffers in flight between the reader and the writer
    #[arg(
        long,
        global = true,
        default_value_t = common::config::DEFAULT_MAX_BUF_NUM,
        value_name = "N",
        help_heading = "Buffering"
    )]
    max_buf_num: usize,

    /// Size of a single buffer (e.g. "10MiB", "4KiB", "1MB")
    #[arg(
        long,
        global = true,
        default_value = "10MiB",
        value_name = "SIZE",
        help_heading = "Buffering"
    )]
    buf_size: bytesize::ByteSize,

    /// Copy with a single read/write loop instead of separate reader and writer tasks
    #[arg(short, long, global = true, help_heading = "Buffering")]
    single_thread: bool,

    // Endpoints
    /// Read this many zero bytes instead of a file or a connection (e.g. "100MiB", "4KiB")
    #[arg(long, global = true, value_name = "SIZE", help_heading = "Endpoints")]
    dummy_input: Option<bytesize::ByteSize>,

    /// Throw away everything instead of writing to a file or a connection
    #[arg(long, global = true, help_heading = "Endpoints")]
    dummy_output: bool,

    // Progress & output
    /// Show progress
    #[arg(long, global = true, help_heading = "Progress & output")]
    progress: bool,

    /// Set the type of progress display
    ///
    /// If specified, --progress flag is implied.
    #[arg(
        long,
        global = true,
        value_name = "TYPE",
        help_heading = "Progress & output"
    )]
    progress_type: Option<common::ProgressType>,

    /// Set delay between progress updates
    ///
    /// Default is 1s for interactive mode (`ProgressBar`) and 10s for non-interactive mode (`TextUpdates`). If specified, --progress flag is implied. Accepts human-readable durations like "500ms", "10s", "1min".
    #[arg(
        long,
        global = true,
        value_name = "DELAY",
        value_parser = humantime::parse_duration,
        help_heading = "Progress & output"
    )]
    progress_delay: Option<std::time::Duration>,

    /// Print summary at the end, even with --quiet
    #[arg(long, global = true, help_heading = "Progress & output")]
    summary: bool,

    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(
        short = 'v',
        long = "verbose",
        global = true,
        action = clap::ArgAction::Count,
        help_heading = "Progress & output"
    )]
    verbose: u8,

    /// Quiet mode, don't report errors or the summary
    #[arg(
        short = 'q',
        long = "quiet",
        global = true,
        help_heading = "Progress & output"
    )]
    quiet: bool,

    // Performance & throttling
    /// Limit buffer reads per second (0 = no throttle)
    #[arg(
        long,
        global = true,
        default_value = "0",
        value_name = "N",
        help_heading = "Performance & throttling"
    )]
    iops_throttle: usize,

    // Advanced settings
    /// Number of worker threads (0 = number of CPU cores)
    #[arg(
        long,
        global = true,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads (0 = Tokio default of 512)
    #[arg(
        long,
        global = true,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    /// Write logs to this file instead of stderr
    #[arg(
        long,
        global = true,
        value_name = "FILE",
        help_heading = "Advanced settings"
    )]
    debug_log: Option<String>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Send a file (or dummy data) to a listening TCP port
    ///
    /// Example: rcp send -d 10.10.10.10:1987 -i input_filename
    Send {
        /// Input file
        #[arg(short, long, value_name = "FILE")]
        input: Option<std::path::PathBuf>,

        /// Address to dial (e.g. 198.51.100.1:1987)
        #[arg(short, long, value_name = "ADDR")]
        dial_addr: Option<String>,
    },
    /// Accept one TCP connection and save (or discard) what arrives
    ///
    /// Example: rcp listen -l 0.0.0.0:1987 -o output_filename
    Listen {
        /// Address to listen on [default: 0.0.0.0:1987, unless --dummy-input is given]
        #[arg(short, long, value_name = "ADDR")]
        listen_addr: Option<String>,

        /// Output file
        #[arg(short, long, value_name = "FILE")]
        output: Option<std::path::PathBuf>,
    },
}

fn endpoints(args: &Args) -> common::EndpointConfig {
    let dummy_input = args.dummy_input.map(|size| size.as_u64());
    let endpoints = common::EndpointConfig {
        dummy_input,
        dummy_output: args.dummy_output,
        ..Default::default()
    };
    match &args.command {
        Command::Send { input, dial_addr } => common::EndpointConfig {
            input: input.clone(),
            dial_addr: dial_addr.clone(),
            ..endpoints
        },
        Command::Listen {
            listen_addr,
            output,
        } => common::EndpointConfig {
            // synthetic input replaces the connection unless an address was asked for
            listen_addr: listen_addr.clone().or_else(|| {
                dummy_input
                    .is_none()
                    .then(|| common::streams::DEFAULT_LISTEN_ADDR.to_string())
            }),
            output: output.clone(),
            ..endpoints
        },
    }
}

fn settings(args: &Args) -> anyhow::Result<common::Settings> {
    let buf_size = usize::try_from(args.buf_size.as_u64())
        .with_context(|| format!("buffer size {} is too large", args.buf_size))?;
    Ok(common::Settings {
        transfer: common::TransferConfig {
            max_buf_num: args.max_buf_num,
            buf_size,
            single_thread: args.single_thread,
        },
        endpoints: endpoints(args),
        progress: if args.progress || args.progress_type.is_some() || args.progress_delay.is_some()
        {
            Some(common::ProgressSettings {
                progress_type: args.progress_type.unwrap_or_default(),
                progress_delay: args.progress_delay,
            })
        } else {
            None
        },
        throttle: common::ThrottleConfig {
            iops_throttle: args.iops_throttle,
        },
    })
}

#[instrument]
async fn async_main(args: Args) -> anyhow::Result<common::Summary> {
    let settings = settings(&args)?;
    let cancel = tokio_util::sync::CancellationToken::new();
    match common::transfer::run(&settings, cancel).await {
        Ok(summary) => Ok(summary),
        Err(error) => Err(anyhow!("{:#}\n\n{}", error, &error.summary)),
    }
}

fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let tracing = common::TracingConfig {
        debug_log_file: args.debug_log.clone(),
    };
    let res = common::run(output, runtime, tracing, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
