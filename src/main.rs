extern crate sluice;

use std::env;
use std::io;
use std::io::Write;
use std::process;

use sluice::{Input, PipelineSpec};

const USAGE: &str = "\
usage: sluice <infile> <cmd1> [<cmd2> ...] <outfile>
       sluice here_doc <sentinel> <cmd1> [<cmd2> ...] <outfile>";

fn build_spec(args: &[String]) -> Result<PipelineSpec, String> {
	if args.first().map(String::as_str) == Some("here_doc") {
		// here_doc <sentinel> <cmd1> ... <outfile>
		if args.len() < 4 {
			return Err(USAGE.to_string());
		}
		let commands = args[2..args.len() - 1].to_vec();
		PipelineSpec::new(Input::Heredoc(args[1].clone()), commands, &args[args.len() - 1])
			.map_err(|err| format!("sluice: {}", err))
	} else {
		// <infile> <cmd1> ... <outfile>
		if args.len() < 3 {
			return Err(USAGE.to_string());
		}
		let commands = args[1..args.len() - 1].to_vec();
		PipelineSpec::new(Input::File(args[0].clone()), commands, &args[args.len() - 1])
			.map_err(|err| format!("sluice: {}", err))
	}
}

fn main() {
	let args: Vec<String> = env::args().skip(1).collect();

	let spec = match build_spec(&args) {
		Ok(spec) => spec,
		Err(msg) => {
			let _ = writeln!(io::stderr(), "{}", msg);
			process::exit(1);
		}
	};

	match sluice::run(&spec) {
		Ok(status) => process::exit(status),
		Err(err) => {
			let _ = writeln!(io::stderr(), "sluice: {}", err);
			process::exit(1);
		}
	}
}
