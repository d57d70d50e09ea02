use std::env;

use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser};
use flexi_logger::{FileSpec, Logger};
use log::info;

use corral::{default_format, run, CorralBuilder, CorralError, CorralExit, CorralOption};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a program inside freshly created cgroups, tied to the life of this process", long_about = None)]
struct Cli {
  #[arg(
    short,
    long,
    value_name = "CONTROLLER",
    help = "Cgroup controller to create (may be specified multiple times)"
  )]
  controller: Vec<String>,

  #[arg(short, long, help = "Cgroup path shared by all controllers")]
  path: Option<String>,

  #[arg(
    short,
    long,
    value_name = "KEY=VALUE",
    help = "Cgroup variable for the last declared controller (may be specified multiple times)"
  )]
  set: Vec<String>,

  #[arg(
    short = 'k',
    long = "delay-to-sigkill",
    value_name = "MICROSECONDS",
    help = "Delay between SIGTERM and SIGKILL to the child"
  )]
  delay_to_sigkill: Option<u64>,

  #[arg(
    short,
    long,
    value_name = "UID/USER",
    help = "Drop privilege to this uid or user before exec"
  )]
  uid: Option<String>,

  #[arg(
    short,
    long,
    value_name = "GID/GROUP",
    help = "Drop privilege to this gid or group before exec"
  )]
  gid: Option<String>,

  #[arg(
    last = true,
    value_name = "PROGRAM [ARGS]",
    help = "The program to run and its arguments, after --"
  )]
  command: Vec<String>,
}

enum Declaration {
  Controller(String),
  Set(String),
}

impl Cli {
  fn resolve(self, matches: &ArgMatches) -> Result<CorralOption, CorralError> {
    let mut builder = CorralBuilder::new();

    if let Some(path) = self.path {
      builder = builder.path(path)?;
    }
    if let Some(delay) = self.delay_to_sigkill {
      builder = builder.grace_micros(delay)?;
    }
    if let Some(uid) = &self.uid {
      builder = builder.uid(uid)?;
    }
    if let Some(gid) = &self.gid {
      builder = builder.gid(gid)?;
    }

    // Replay -c and -s in command line order so every setting lands on the
    // controller declared most recently before it
    let mut declarations = vec![];
    for (id, wrap) in [
      ("controller", Declaration::Controller as fn(String) -> Declaration),
      ("set", Declaration::Set as fn(String) -> Declaration),
    ] {
      if let Some(indices) = matches.indices_of(id) {
        let values = matches.get_many::<String>(id).unwrap();
        for (index, value) in indices.zip(values) {
          declarations.push((index, wrap(value.clone())));
        }
      }
    }
    declarations.sort_by_key(|(index, _)| *index);
    for (_, declaration) in declarations {
      builder = match declaration {
        Declaration::Controller(name) => builder.controller(name),
        Declaration::Set(text) => builder.set(text)?,
      };
    }

    let mut command = self.command.into_iter();
    if let Some(program) = command.next() {
      builder = builder.command(program, command.collect::<Vec<String>>());
    }

    builder.build()
  }
}

fn bootstrap() -> Result<u8, CorralError> {
  let logger = Logger::try_with_env_or_str("corral=warn")?;
  let logger = match env::var("CORRAL_LOG") {
    Ok(dir) => logger
      .log_to_file(
        FileSpec::default()
          .directory(dir)
          .basename("corral")
          .discriminant(format!(
            "{}",
            chrono::offset::Local::now().format("%Y-%m-%d")
          ))
          .suppress_timestamp(),
      )
      .append()
      .format_for_files(default_format),
    Err(_) => logger,
  };
  logger.start()?;

  let matches = Cli::command().get_matches();
  let cli = Cli::from_arg_matches(&matches).map_err(|err| CorralError::cli(err.to_string()))?;

  let option = match cli.resolve(&matches) {
    Ok(option) => option,
    Err(err) => {
      // Option errors come with the usage block, like bad flags do
      let _ = Cli::command().print_help();
      return Err(err);
    }
  };

  info!("Start running corral");
  run(&option)
}

fn main() -> CorralExit {
  match bootstrap() {
    Ok(code) => CorralExit::Code(code),
    Err(err) => CorralExit::Err(err),
  }
}
