use clap::{Parser, Subcommand, ValueEnum};
use vela_engine::ProtocolHint;
use vela_engine::sink::SurfaceSize;

#[derive(Parser, Debug)]
#[command(name = "vela", version, about = "Headless probe for adaptive streams")]
pub struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty, global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Play a stream headlessly and report engine events
    Probe(ProbeArgs),

    /// Print which adapter would handle a URL
    Detect {
        /// Stream URL
        url: String,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub struct ProbeArgs {
    /// Stream URL (HLS playlist, DASH manifest or media file)
    pub url: String,

    /// Adapter to use: auto, segmented (hls), dynamic (dash) or direct
    #[arg(short, long, default_value = "auto")]
    pub protocol: ProtocolHint,

    /// Start position in seconds
    #[arg(long)]
    pub start: Option<f64>,

    /// Play close to the live edge
    #[arg(long)]
    pub low_latency: bool,

    /// Pin a quality level index instead of adapting
    #[arg(long)]
    pub quality: Option<usize>,

    /// Render surface, e.g. 1280x720 or 1280x720@2
    #[arg(long, value_parser = parse_surface)]
    pub surface: Option<SurfaceSize>,

    /// Extra request header, e.g. -H "Referer: https://example.com"
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,

    /// Stop after this many seconds, 0 to run until the stream ends
    #[arg(short, long, default_value_t = 30)]
    pub duration: u64,

    /// Print events as JSON lines
    #[arg(long)]
    pub json: bool,

    /// Override the User-Agent header
    #[arg(long, env = "VELA_USER_AGENT")]
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

fn parse_surface(value: &str) -> Result<SurfaceSize, String> {
    let (size, ratio) = match value.split_once('@') {
        Some((size, ratio)) => (size, Some(ratio)),
        None => (value, None),
    };
    let (width, height) = size
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got `{value}`"))?;
    let width = width
        .trim()
        .parse::<u32>()
        .map_err(|e| format!("invalid width: {e}"))?;
    let height = height
        .trim()
        .parse::<u32>()
        .map_err(|e| format!("invalid height: {e}"))?;

    let mut surface = SurfaceSize::new(width, height);
    if let Some(ratio) = ratio {
        let ratio = ratio
            .trim()
            .parse::<f64>()
            .map_err(|e| format!("invalid pixel ratio: {e}"))?;
        if !(ratio > 0.0 && ratio.is_finite()) {
            return Err(format!("pixel ratio must be positive, got {ratio}"));
        }
        surface.pixel_ratio = ratio;
    }
    Ok(surface)
}

fn parse_header(value: &str) -> Result<(String, String), String> {
    let (name, value) = value
        .split_once(':')
        .ok_or_else(|| format!("expected `Name: value`, got `{value}`"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err("header name is empty".to_string());
    }
    Ok((name.to_string(), value.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Args::command().debug_assert();
    }

    #[test]
    fn parses_surfaces() {
        let surface = parse_surface("1280x720").unwrap();
        assert_eq!((surface.width, surface.height), (1280, 720));
        assert_eq!(surface.pixel_ratio, 1.0);

        let surface = parse_surface("640X360@2").unwrap();
        assert_eq!((surface.width, surface.height), (640, 360));
        assert_eq!(surface.pixel_ratio, 2.0);

        assert!(parse_surface("1280").is_err());
        assert!(parse_surface("1280x720@0").is_err());
    }

    #[test]
    fn parses_headers() {
        assert_eq!(
            parse_header("Referer: https://example.com/a:b").unwrap(),
            ("Referer".to_string(), "https://example.com/a:b".to_string())
        );
        assert!(parse_header("no-colon").is_err());
        assert!(parse_header(": value").is_err());
    }

    #[test]
    fn parses_probe_arguments() {
        let args = Args::try_parse_from([
            "vela",
            "probe",
            "http://cdn.example/master.m3u8",
            "--protocol",
            "hls",
            "-H",
            "Referer: https://example.com",
            "--quality",
            "2",
            "--json",
        ])
        .unwrap();
        let Commands::Probe(probe) = args.command else {
            panic!("expected probe");
        };
        assert_eq!(probe.protocol, ProtocolHint::Segmented);
        assert_eq!(probe.headers.len(), 1);
        assert_eq!(probe.quality, Some(2));
        assert!(probe.json);
        assert_eq!(probe.duration, 30);
    }
}
