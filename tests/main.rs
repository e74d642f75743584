extern crate sluice;

use std::fs;
use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::os::unix::io::FromRawFd;
use std::path::Path;
use std::process::{Command, Stdio};

use sluice::{Error, Input, PipelineSpec, ResolveError};

const INPUT: &str = "./tests/input.txt";

macro_rules! assert_file_contents {
	($file:expr, $contents:expr) => {
		let msg = format!("opening file failed: {}", $file);
		let mut file = File::open($file).expect(msg.as_str());

		let msg = format!("reading file failed: {}", $file);
		let mut s = String::new();
		file.read_to_string(&mut s).expect(msg.as_str());
		assert_eq!(s.as_str(), $contents);
	};
}

fn remove_output_file(name: &str) {
	if Path::new(name).exists() {
		let msg = format!("error removing file: {}", name);
		fs::remove_file(name).expect(msg.as_str());
	}
}

fn file_spec(commands: &[&str], outfile: &str) -> PipelineSpec {
	PipelineSpec::new(
		Input::File(INPUT.to_string()),
		commands.iter().map(|command| command.to_string()).collect(),
		outfile,
	).expect("building spec failed")
}

#[test]
fn three_stage_pipeline() {
	let outfile = "./tests/three_stage_pipeline.txt";
	remove_output_file(outfile);

	let status = sluice::run(&file_spec(&["grep spam", "cat", "wc -l"], outfile))
		.expect("pipeline failed");

	assert_eq!(status, 0);
	assert_file_contents!(outfile, "3\n");
}

#[test]
fn single_stage() {
	let outfile = "./tests/single_stage.txt";
	remove_output_file(outfile);

	let status = sluice::run(&file_spec(&["cat"], outfile)).expect("pipeline failed");

	assert_eq!(status, 0);
	let fixture = fs::read_to_string(INPUT).expect("reading fixture failed");
	assert_file_contents!(outfile, fixture.as_str());
}

// A leaked write end anywhere in parent or child would leave some stage
// waiting for end-of-stream forever, so termination is the assertion.
#[test]
fn deep_chain_terminates() {
	let outfile = "./tests/deep_chain_terminates.txt";
	remove_output_file(outfile);

	let status = sluice::run(&file_spec(&["cat", "cat", "cat", "cat", "wc -l"], outfile))
		.expect("pipeline failed");

	assert_eq!(status, 0);
	assert_file_contents!(outfile, "5\n");
}

#[test]
fn sink_truncated_between_runs() {
	let outfile = "./tests/sink_truncated_between_runs.txt";
	remove_output_file(outfile);

	let bytes = fs::metadata(INPUT).expect("fixture metadata failed").len();
	let expected = format!("{}\n", bytes);

	sluice::run(&file_spec(&["wc -c"], outfile)).expect("first run failed");
	sluice::run(&file_spec(&["wc -c"], outfile)).expect("second run failed");

	assert_file_contents!(outfile, expected.as_str());
}

#[test]
fn last_stage_status_wins() {
	let outfile = "./tests/last_stage_status_wins.txt";
	remove_output_file(outfile);

	let status = sluice::run(&file_spec(&["cat", "false"], outfile))
		.expect("pipeline failed");

	assert_eq!(status, 1);
}

#[test]
fn not_found_in_last_stage() {
	let outfile = "./tests/not_found_in_last_stage.txt";
	remove_output_file(outfile);

	let status = sluice::run(&file_spec(&["cat", "sluice_no_such_cmd_xyz"], outfile))
		.expect("pipeline failed");

	assert_eq!(status, 127);
}

#[test]
fn not_found_in_first_stage_is_not_fatal() {
	let outfile = "./tests/not_found_in_first_stage.txt";
	remove_output_file(outfile);

	let status = sluice::run(&file_spec(&["sluice_no_such_cmd_xyz", "wc -c"], outfile))
		.expect("pipeline failed");

	// the failed stage closed its pipe end, so wc saw end-of-stream
	assert_eq!(status, 0);
	assert_file_contents!(outfile, "0\n");
}

#[test]
fn missing_input_is_preflight() {
	let spec = PipelineSpec::new(
		Input::File("./tests/no_such_input.txt".to_string()),
		vec!["cat".to_string()],
		"./tests/missing_input_is_preflight.txt",
	).expect("building spec failed");

	let res = sluice::run(&spec);
	assert!(matches!(&res, Err(Error::InputMissing(_))), "got: {:?}", res);
	assert!(!Path::new("./tests/missing_input_is_preflight.txt").exists());
}

#[test]
fn unwritable_output_is_preflight() {
	let spec = PipelineSpec::new(
		Input::File(INPUT.to_string()),
		vec!["cat".to_string()],
		"./tests/no_such_dir/out.txt",
	).expect("building spec failed");

	let res = sluice::run(&spec);
	assert!(matches!(&res, Err(Error::Output(_, _))), "got: {:?}", res);
}

#[test]
fn empty_command_is_rejected() {
	let res = PipelineSpec::new(
		Input::File(INPUT.to_string()),
		vec!["cat".to_string(), "   ".to_string()],
		"out.txt",
	);
	assert!(matches!(&res, Err(Error::EmptyCommand(1))), "got: {:?}", res.err());
}

#[test]
fn no_commands_is_rejected() {
	let res = PipelineSpec::new(Input::File(INPUT.to_string()), Vec::new(), "out.txt");
	assert!(matches!(&res, Err(Error::NoCommands)), "got: {:?}", res.err());
}

#[test]
fn heredoc_spec_appends() {
	let spec = PipelineSpec::new(
		Input::Heredoc("EOF".to_string()),
		vec!["cat".to_string()],
		"out.txt",
	).expect("building spec failed");
	assert!(spec.appends());

	let spec = PipelineSpec::new(
		Input::File(INPUT.to_string()),
		vec!["cat".to_string()],
		"out.txt",
	).expect("building spec failed");
	assert!(!spec.appends());
}

#[test]
fn heredoc_stops_at_sentinel() {
	let input = Cursor::new("hello\nworld\nEOF\nafter the sentinel\n");
	let (buf, saw_sentinel) = sluice::read_heredoc(input, "EOF");

	assert!(saw_sentinel);
	assert_eq!(buf, b"hello\nworld\n");
}

#[test]
fn heredoc_without_sentinel_keeps_partial_buffer() {
	let input = Cursor::new("hello\nworld\n");
	let (buf, saw_sentinel) = sluice::read_heredoc(input, "EOF");

	assert!(!saw_sentinel);
	assert_eq!(buf, b"hello\nworld\n");
}

#[test]
fn heredoc_sentinel_must_match_exactly() {
	let input = Cursor::new("EOF \n EOF\nEOFEOF\nEOF\n");
	let (buf, saw_sentinel) = sluice::read_heredoc(input, "EOF");

	assert!(saw_sentinel);
	assert_eq!(buf, b"EOF \n EOF\nEOFEOF\n");
}

#[test]
fn heredoc_fd_reads_back_as_stream() {
	let mut fd = sluice::heredoc_fd(b"hello\nworld\n").expect("heredoc fd failed");

	let mut file = unsafe { File::from_raw_fd(fd.take()) };
	let mut s = String::new();
	file.read_to_string(&mut s).expect("reading heredoc fd failed");
	assert_eq!(s, "hello\nworld\n");
}

#[test]
fn output_append_preserves_existing_content() {
	let outfile = "./tests/output_append_preserves.txt";
	remove_output_file(outfile);

	let mut fd = sluice::open_output(outfile, false).expect("open failed");
	let mut file = unsafe { File::from_raw_fd(fd.take()) };
	file.write_all(b"first\n").expect("write failed");
	drop(file);

	let mut fd = sluice::open_output(outfile, true).expect("append open failed");
	let mut file = unsafe { File::from_raw_fd(fd.take()) };
	file.write_all(b"second\n").expect("write failed");
	drop(file);

	assert_file_contents!(outfile, "first\nsecond\n");
}

#[test]
fn resolve_finds_commands_on_path() {
	assert!(sluice::resolve("sh").is_ok());
	assert_eq!(sluice::resolve("sluice_no_such_cmd_xyz"), Err(ResolveError::NotFound));
}

#[test]
fn resolve_rejects_non_executable() {
	// probed as given because of the slash; exists but is not executable
	assert_eq!(sluice::resolve("./tests/input.txt"), Err(ResolveError::NotExecutable));
}

#[test]
fn split_is_plain_whitespace() {
	assert_eq!(sluice::split("grep  -i   spam"), vec!["grep", "-i", "spam"]);
	assert!(sluice::split("   ").is_empty());
}

// ========== CLI ==============================================================

const BIN: &str = env!("CARGO_BIN_EXE_sluice");

#[test]
fn cli_usage_error() {
	let status = Command::new(BIN)
		.status()
		.expect("running binary failed");
	assert_eq!(status.code(), Some(1));
}

#[test]
fn cli_runs_pipeline() {
	let outfile = "./tests/cli_runs_pipeline.txt";
	remove_output_file(outfile);

	let status = Command::new(BIN)
		.args(&[INPUT, "grep spam", "wc -l", outfile])
		.status()
		.expect("running binary failed");

	assert_eq!(status.code(), Some(0));
	assert_file_contents!(outfile, "3\n");
}

#[test]
fn cli_reports_not_found_status() {
	let outfile = "./tests/cli_reports_not_found.txt";
	remove_output_file(outfile);

	let status = Command::new(BIN)
		.args(&[INPUT, "cat", "sluice_no_such_cmd_xyz", outfile])
		.stderr(Stdio::null())
		.status()
		.expect("running binary failed");

	assert_eq!(status.code(), Some(127));
}

#[test]
fn cli_here_doc_appends_across_runs() {
	let outfile = "./tests/cli_here_doc_appends.txt";
	remove_output_file(outfile);

	let mut child = Command::new(BIN)
		.args(&["here_doc", "EOF", "cat", outfile])
		.stdin(Stdio::piped())
		.spawn()
		.expect("running binary failed");
	child.stdin.as_mut().unwrap()
		.write_all(b"hello\nworld\nEOF\nnever seen\n")
		.expect("writing heredoc failed");
	let status = child.wait().expect("waiting for binary failed");

	assert_eq!(status.code(), Some(0));
	assert_file_contents!(outfile, "hello\nworld\n");

	let mut child = Command::new(BIN)
		.args(&["here_doc", "EOF", "cat", outfile])
		.stdin(Stdio::piped())
		.spawn()
		.expect("running binary failed");
	child.stdin.as_mut().unwrap()
		.write_all(b"again\nEOF\n")
		.expect("writing heredoc failed");
	let status = child.wait().expect("waiting for binary failed");

	assert_eq!(status.code(), Some(0));
	assert_file_contents!(outfile, "hello\nworld\nagain\n");
}

#[test]
fn cli_here_doc_without_sentinel_warns_but_runs() {
	let outfile = "./tests/cli_here_doc_without_sentinel.txt";
	remove_output_file(outfile);

	let mut child = Command::new(BIN)
		.args(&["here_doc", "EOF", "cat", outfile])
		.stdin(Stdio::piped())
		.stderr(Stdio::piped())
		.spawn()
		.expect("running binary failed");
	child.stdin.take().unwrap()
		.write_all(b"partial\n")
		.expect("writing heredoc failed");
	let out = child.wait_with_output().expect("waiting for binary failed");

	assert_eq!(out.status.code(), Some(0));
	let stderr = String::from_utf8(out.stderr).expect("stderr was not UTF-8");
	assert!(stderr.contains("without sentinel"), "stderr: {}", stderr);
	assert_file_contents!(outfile, "partial\n");
}
