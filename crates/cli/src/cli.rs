use clap::Parser;

/// Drive the KDS scheduler against a simulated CU fabric.
///
/// Configures the device with a CONFIGURE packet, pushes a batch of
/// START_CU commands through it from one or more client contexts and
/// reports the scheduler metrics once everything has retired.
#[derive(Parser, Debug)]
#[command(name = "kds-sim", about = "Run the KDS command scheduler on a simulated fabric")]
pub struct CliArgs {
    /// Scheduler config file (TOML). Falls back to KDS_* environment variables.
    #[arg(long, env = "KDS_CONFIG")]
    pub config: Option<String>,

    /// Fabric description (default: ~/.config/kds/fabric.toml)
    #[arg(long, env = "KDS_FABRIC")]
    pub fabric: Option<String>,

    /// HLS CUs to generate when the fabric file lists none
    #[arg(long, default_value = "2")]
    pub hls: usize,

    /// ACC CUs to generate when the fabric file lists none
    #[arg(long, default_value = "0")]
    pub acc: usize,

    /// log2 of the start queue depth of generated HLS CUs (0 = single job)
    #[arg(long, default_value = "0")]
    pub hls_queue_log2: u32,

    /// Ticks from start to completion for generated CUs
    #[arg(long, default_value = "4")]
    pub latency: u32,

    /// START_CU commands to submit in total
    #[arg(long, default_value = "64")]
    pub commands: usize,

    /// Client contexts sharing the submissions
    #[arg(long, default_value = "1")]
    pub clients: usize,

    /// Complete commands on CU interrupts instead of polling
    #[arg(long)]
    pub interrupts: bool,

    /// Period of the fabric clock in interrupt mode, in microseconds
    #[arg(long, default_value = "20")]
    pub tick_us: u64,

    /// Give up waiting for the batch after this many seconds
    #[arg(long, default_value = "30")]
    pub timeout_secs: u64,

    /// Print the final metrics as JSON
    #[arg(long)]
    pub json: bool,
}

