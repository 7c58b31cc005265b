use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "meter-poller",
    version,
    about = "Hourly meter polling with historical backfill"
)]
pub struct Args {
    /// Run one historical backfill and exit.
    #[arg(long, default_value_t = false)]
    pub once: bool,
    /// Print the effective configuration as JSON and exit.
    #[arg(long, default_value_t = false)]
    pub print_config: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_parse() {
        let args = Args::try_parse_from(["meter-poller", "--once"]).unwrap();
        assert!(args.once);
        assert!(!args.print_config);

        let args = Args::try_parse_from(["meter-poller", "--print-config"]).unwrap();
        assert!(args.print_config);

        assert!(Args::try_parse_from(["meter-poller", "--bogus"]).is_err());
    }
}
