// src/config.rs

//! Command-line options. The flags are deliberately terse; everything
//! interesting lives in the configuration file they point at.

use std::path::PathBuf;

/// Configuration file name used when `-c` is absent, relative to the prefix.
pub const DEFAULT_CONF: &str = "peridot.conf";

pub struct Opts {
    /// `-p` prefix directory; every relative path resolves under it.
    pub prefix: PathBuf,
    /// `-c` configuration file.
    pub conf_path: Option<PathBuf>,
    /// `-g` directives prepended to the main file.
    pub directives: String,
    /// `-t` test-config mode.
    pub test_config: bool,
    /// `-q` suppress the success message in test mode.
    pub quiet: bool,
    /// `-s stop|quit|reopen|reload`.
    pub signal: Option<String>,
    /// `-v`.
    pub show_version: bool,
    /// `-V`.
    pub show_build_info: bool,
    /// Original argv, kept for the binary-upgrade re-exec.
    pub argv: Vec<String>,
    /// The running executable.
    pub binary: PathBuf,
}

pub const USAGE: &str = "Usage: peridot [-vVtq] [-s signal] [-c filename] [-p prefix] [-g directives]

Options:
  -v            : show version and exit
  -V            : show version and build information, then exit
  -t            : test configuration and exit
  -q            : suppress non-error messages during configuration testing
  -s signal     : send signal to a master process: stop, quit, reopen, reload
  -p prefix     : set prefix path
  -c filename   : set configuration file
  -g directives : set global directives out of configuration file";

impl Opts {
    pub fn parse(argv: Vec<String>) -> Result<Opts, String> {
        let binary = PathBuf::from(argv.first().cloned().unwrap_or_default());
        let mut opts = Opts {
            prefix: PathBuf::from("./"),
            conf_path: None,
            directives: String::new(),
            test_config: false,
            quiet: false,
            signal: None,
            show_version: false,
            show_build_info: false,
            argv: argv.clone(),
            binary,
        };

        let mut iter = argv.iter().skip(1);
        while let Some(arg) = iter.next() {
            let mut value_for = |flag: &str| {
                iter.next()
                    .cloned()
                    .ok_or_else(|| format!("option \"{flag}\" requires a value\n\n{USAGE}"))
            };

            match arg.as_str() {
                "-c" => opts.conf_path = Some(PathBuf::from(value_for("-c")?)),
                "-p" => opts.prefix = PathBuf::from(value_for("-p")?),
                "-g" => opts.directives = value_for("-g")?,
                "-s" => {
                    let signal = value_for("-s")?;
                    match signal.as_str() {
                        "stop" | "quit" | "reopen" | "reload" => opts.signal = Some(signal),
                        other => {
                            return Err(format!("invalid option: -s {other}\n\n{USAGE}"));
                        }
                    }
                }
                "-t" => opts.test_config = true,
                "-q" => opts.quiet = true,
                "-v" => opts.show_version = true,
                "-V" => {
                    opts.show_version = true;
                    opts.show_build_info = true;
                }
                other => return Err(format!("invalid option: {other}\n\n{USAGE}")),
            }
        }

        Ok(opts)
    }

    /// The configuration file to parse, resolved against the prefix.
    pub fn conf_file(&self) -> PathBuf {
        match &self.conf_path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => self.prefix.join(path),
            None => self.prefix.join(DEFAULT_CONF),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("peridot")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn defaults_resolve_under_prefix() {
        let opts = Opts::parse(args(&["-p", "/srv/peridot"])).unwrap();
        assert_eq!(opts.conf_file(), PathBuf::from("/srv/peridot/peridot.conf"));
    }

    #[test]
    fn absolute_conf_path_wins_over_prefix() {
        let opts = Opts::parse(args(&["-p", "/srv", "-c", "/etc/p.conf"])).unwrap();
        assert_eq!(opts.conf_file(), PathBuf::from("/etc/p.conf"));
    }

    #[test]
    fn signal_names_are_validated() {
        assert!(Opts::parse(args(&["-s", "reload"])).is_ok());
        assert!(Opts::parse(args(&["-s", "bounce"])).is_err());
    }

    #[test]
    fn flags_combine() {
        let opts = Opts::parse(args(&["-t", "-q", "-g", "daemon off;"])).unwrap();
        assert!(opts.test_config);
        assert!(opts.quiet);
        assert_eq!(opts.directives, "daemon off;");
    }

    #[test]
    fn unknown_flags_are_rejected() {
        assert!(Opts::parse(args(&["-x"])).is_err());
    }
}
