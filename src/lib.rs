//! # sluice
//!
//! Runs a linear shell-style command pipeline: N external commands where
//! command *i*'s stdout feeds command *i+1*'s stdin, the first command
//! reads from a file (or an interactively typed heredoc terminated by a
//! sentinel line) and the last command writes to a file.
//!
//! ```no_run
//! use sluice::{Input, PipelineSpec};
//!
//! let spec = PipelineSpec::new(
//! 	Input::File("./tests/input.txt".to_string()),
//! 	vec!["grep spam".to_string(), "wc -l".to_string()],
//! 	"out.txt").expect("bad spec");
//!
//! let status = sluice::run(&spec).expect("pipeline failed");
//! println!("status: {}", status);
//! ```
//!
//! Every pipeline descriptor is opened with `O_CLOEXEC`, so a child
//! carries nothing into exec beyond the two descriptors duplicated onto
//! its standard slots. That rule is what keeps a reader from waiting
//! forever on a write end some unrelated process still holds open.
//!
//! **Note:** Only Linux is tested. Other Unix operating systems might
//! work, too. Windows support is not implemented.

extern crate libc;

use std::env;
use std::ffi::{CStr, CString};
use std::fmt;
use std::fmt::Display;
use std::io;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::ptr;
use std::result;

use libc::{
	fork,
	pipe2, // Linux & FreeBSD
	strerror_r, // XSI
	perror,
	open,
	close,
	dup2,
	pid_t,
	execv,
	mkstemp,
	unlink,
	lseek,
	write,
	access,
	kill,
	waitpid,
	_exit,
	c_char,
	c_int,
	c_void,
	__errno_location, // Linux
	O_RDONLY,
	O_WRONLY,
	O_APPEND,
	O_CREAT,
	O_TRUNC,
	O_RDWR,
	O_CLOEXEC,
	S_IRUSR,
	S_IWUSR,
	S_IRGRP,
	S_IROTH,
	EOPNOTSUPP,
	EISDIR,
	ENOENT,
	EACCES,
	EINTR,
	EXIT_FAILURE,
	F_OK,
	R_OK,
	X_OK,
	SEEK_SET,
	SIGTERM,
	STDIN_FILENO,
	STDOUT_FILENO,
	BUFSIZ,
	fcntl,
	F_GETFD,
	F_SETFD,
	FD_CLOEXEC
};

macro_rules! cstr {
	($str:expr) => {
		($str).as_ptr() as *const c_char
	}
}

macro_rules! os_err {
	($call:expr) => {
		Err(Error::Os($call, unsafe { *__errno_location() }))
	}
}

/// Errors detected in the parent before or while committing to spawn.
///
/// A child's own failures (command not found, exec refused) never show
/// up here: they travel back through that child's exit status only.
pub enum Error {
	/// A libc call failed with the specified `errno`. The string names
	/// the call that failed.
	Os(&'static str, c_int),

	/// The input file does not exist.
	InputMissing(String),

	/// The input file exists but is not readable.
	InputUnreadable(String),

	/// The output file could not be created or opened for writing.
	Output(String, c_int),

	/// A pipeline has to have at least one command.
	NoCommands,

	/// The command string at this stage index is empty or all
	/// whitespace.
	EmptyCommand(usize),

	/// A string contained an interior nul byte and cannot cross the C
	/// boundary.
	Nul(std::ffi::NulError),
}

pub type Result<T> = result::Result<T, Error>;

fn fmt_os_error(errno: c_int, f: &mut dyn fmt::Write) -> fmt::Result {
	write!(f, "OS error code {}: ", errno)?;

	let mut buf = [0u8; BUFSIZ as usize];
	let res: c_int = unsafe {
		strerror_r(errno, buf.as_mut_ptr() as *mut c_char, buf.len())
	};
	if res != 0 {
		return write!(f,
			"(another OS error (code {}) occured getting the error string)",
			if res > 0 { res } else { unsafe { *__errno_location() } });
	}

	let index = match buf.iter().position(|b| *b == 0) {
		Some(index) => index,
		None => {
			return write!(f, "(error getting error string: no nul byte in error string)");
		}
	};

	match CStr::from_bytes_with_nul(&buf[..=index]) {
		Ok(errstr) => {
			match errstr.to_str() {
				Ok(s) => f.write_str(s),
				Err(err) => write!(f, "(error getting error string: {})", err)
			}
		},
		Err(err) => write!(f, "(error getting error string: {})", err)
	}
}

impl Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			Error::Os(call, errno) => {
				write!(f, "{}: ", call)?;
				fmt_os_error(*errno, f)
			},
			Error::InputMissing(path) => write!(f, "{}: no such file or directory", path),
			Error::InputUnreadable(path) => write!(f, "{}: permission denied", path),
			Error::Output(path, errno) => {
				write!(f, "{}: ", path)?;
				fmt_os_error(*errno, f)
			},
			Error::NoCommands => f.write_str("not enough commands (need at least one)"),
			Error::EmptyCommand(stage) => write!(f, "command {} is empty", stage + 1),
			Error::Nul(err) => write!(f, "nul byte in string: {}", err),
		}
	}
}

impl fmt::Debug for Error {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		Display::fmt(self, f)
	}
}

impl From<std::ffi::NulError> for Error {
	fn from(err: std::ffi::NulError) -> Error {
		Error::Nul(err)
	}
}

/// Owner of a single raw file descriptor. `-1` means empty. The
/// descriptor is closed on drop unless it was taken out first.
pub struct Fd {
	fd: c_int
}

impl Fd {
	fn new(fd: c_int) -> Self {
		Fd { fd }
	}

	/// The raw descriptor, still owned by this guard.
	pub fn raw(&self) -> c_int {
		self.fd
	}

	/// Give up ownership of the descriptor without closing it.
	pub fn take(&mut self) -> c_int {
		let fd = self.fd;
		self.fd = -1;
		fd
	}

	pub fn close(&mut self) {
		if self.fd > -1 {
			unsafe { close(self.fd); }
			self.fd = -1;
		}
	}
}

impl Drop for Fd {
	fn drop(&mut self) {
		self.close();
	}
}

/// Open the pipeline's head input file read-only.
///
/// Existence and readability are probed explicitly first so the failure
/// can be attributed precisely: [Error::InputMissing](enum.Error.html#variant.InputMissing)
/// when there is no such file, [Error::InputUnreadable](enum.Error.html#variant.InputUnreadable)
/// when there is one we may not read.
pub fn open_input(path: &str) -> Result<Fd> {
	let cpath = CString::new(path)?;
	if unsafe { access(cpath.as_ptr(), F_OK) } == -1 {
		return Err(Error::InputMissing(path.to_string()));
	}
	if unsafe { access(cpath.as_ptr(), R_OK) } == -1 {
		return Err(Error::InputUnreadable(path.to_string()));
	}
	let fd = unsafe { open(cpath.as_ptr(), O_RDONLY | O_CLOEXEC) };
	if fd == -1 {
		return os_err!("open input");
	}
	Ok(Fd::new(fd))
}

/// Open (creating if absent, mode 0644) the pipeline's tail output file.
///
/// Truncates on normal redirection; appends in heredoc mode, where
/// repeated invocations accumulate output.
pub fn open_output(path: &str, append: bool) -> Result<Fd> {
	let cpath = CString::new(path)?;
	let flags = if append {
		O_WRONLY | O_CREAT | O_APPEND | O_CLOEXEC
	} else {
		O_WRONLY | O_CREAT | O_TRUNC | O_CLOEXEC
	};
	let fd = unsafe {
		open(cpath.as_ptr(), flags, S_IRUSR | S_IWUSR | S_IRGRP | S_IROTH)
	};
	if fd == -1 {
		return Err(Error::Output(path.to_string(), unsafe { *__errno_location() }));
	}
	Ok(Fd::new(fd))
}

/// Read heredoc lines from `input` until a line equals `sentinel`
/// exactly (trailing newline stripped, nothing else), buffering all
/// prior lines with their newlines.
///
/// Returns the buffer and whether the sentinel was actually seen. End of
/// input arriving first is not fatal: the caller emits a diagnostic and
/// delivers whatever was buffered so far.
pub fn read_heredoc<R: BufRead>(mut input: R, sentinel: &str) -> (Vec<u8>, bool) {
	let mut buf = Vec::new();
	let mut line = String::new();
	loop {
		line.clear();
		match input.read_line(&mut line) {
			Ok(0) | Err(_) => return (buf, false),
			Ok(_) => {}
		}
		let stripped = line.strip_suffix('\n').unwrap_or(&line);
		if stripped == sentinel {
			return (buf, true);
		}
		buf.extend_from_slice(stripped.as_bytes());
		buf.push(b'\n');
	}
}

/// Materialize a heredoc buffer behind a real descriptor so downstream
/// stages read it as an ordinary input stream.
///
/// An anonymous temp file is used rather than a pre-filled pipe: a pipe
/// would cap the heredoc at the kernel pipe buffer and deadlock on
/// anything larger.
pub fn heredoc_fd(buf: &[u8]) -> Result<Fd> {
	let mut fd = Fd::new(open_temp_fd());
	if fd.raw() < 0 {
		return os_err!("open heredoc buffer");
	}
	let mut index = 0;
	while index < buf.len() {
		let count = unsafe {
			write(fd.raw(), buf[index..].as_ptr() as *const c_void, buf.len() - index)
		};
		if count < 0 {
			if unsafe { *__errno_location() } == EINTR {
				continue;
			}
			return os_err!("write heredoc buffer");
		}
		index += count as usize;
	}
	if unsafe { lseek(fd.raw(), 0, SEEK_SET) } == -1 {
		return os_err!("rewind heredoc buffer");
	}
	Ok(fd)
}

fn open_temp_fd_fallback() -> c_int {
	let mut name: [u8; 18] = *b"/tmp/sluiceXXXXXX\0";
	let fd = unsafe { mkstemp(name.as_mut_ptr() as *mut c_char) };
	if fd < 0 {
		return -1;
	}

	if unsafe { unlink(cstr!(name)) } != 0 {
		unsafe { close(fd); }
		return -1;
	}

	// mkstemp cannot set close-on-exec itself
	let flags = unsafe { fcntl(fd, F_GETFD) };
	if flags == -1 || unsafe { fcntl(fd, F_SETFD, flags | FD_CLOEXEC) } == -1 {
		unsafe { close(fd); }
		return -1;
	}

	fd
}

fn open_temp_fd() -> c_int {
	if cfg!(target_os = "linux") {
		let fd = unsafe {
			open(cstr!(b"/tmp\0"), libc::O_TMPFILE | O_RDWR | O_CLOEXEC, S_IRUSR | S_IWUSR)
		};
		if fd < 0 {
			let errno = unsafe { *__errno_location() };
			match errno {
				EOPNOTSUPP | EISDIR | ENOENT => return open_temp_fd_fallback(),
				_ => {}
			}
		}

		fd
	} else {
		open_temp_fd_fallback()
	}
}

/// An anonymous pipe connecting stage *i*'s stdout to stage *i+1*'s
/// stdin. Both ends carry `O_CLOEXEC`; whatever is still owned when the
/// link drops is closed.
pub struct PipeLink {
	read: c_int,
	write: c_int,
}

impl PipeLink {
	fn new() -> Result<Self> {
		let mut pair: [c_int; 2] = [-1, -1];
		if unsafe { pipe2(pair.as_mut_ptr(), O_CLOEXEC) } == -1 {
			return os_err!("pipe2");
		}
		Ok(PipeLink { read: pair[0], write: pair[1] })
	}

	pub fn read_end(&self) -> c_int {
		self.read
	}

	pub fn write_end(&self) -> c_int {
		self.write
	}
}

impl Drop for PipeLink {
	fn drop(&mut self) {
		unsafe {
			if self.read > -1 {
				close(self.read);
				self.read = -1;
			}
			if self.write > -1 {
				close(self.write);
				self.write = -1;
			}
		}
	}
}

/// Create the N-1 pipes for an N stage pipeline, all up front and before
/// any fork, so descriptor-table exhaustion is detected while no child
/// exists yet. On failure the links allocated so far close via drop.
pub fn build_chain(n_stages: usize) -> Result<Vec<PipeLink>> {
	let mut links = Vec::with_capacity(n_stages.saturating_sub(1));
	for _ in 1..n_stages {
		links.push(PipeLink::new()?);
	}
	Ok(links)
}

/// Why a command name could not be resolved to an executable.
#[derive(PartialEq, Eq)]
pub enum ResolveError {
	/// No file of that name exists in any `PATH` entry. Reserved exit
	/// status 127.
	NotFound,

	/// A file was found somewhere but none of the candidates is
	/// executable. Reserved exit status 126.
	NotExecutable,
}

impl ResolveError {
	/// The reserved exit status a child reports for this failure.
	pub fn status(&self) -> c_int {
		match self {
			ResolveError::NotFound => 127,
			ResolveError::NotExecutable => 126,
		}
	}
}

impl Display for ResolveError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			ResolveError::NotFound => f.write_str("command not found"),
			ResolveError::NotExecutable => f.write_str("permission denied"),
		}
	}
}

impl fmt::Debug for ResolveError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		Display::fmt(self, f)
	}
}

/// Split a command string into words. Plain whitespace splitting, no
/// quoting or escapes.
pub fn split(command: &str) -> Vec<String> {
	command.split_whitespace().map(|word| word.to_string()).collect()
}

/// Resolve a command name against the inherited environment's `PATH`.
///
/// Names containing a `/` are probed as given. The environment is only
/// consulted, never modified.
pub fn resolve(name: &str) -> result::Result<CString, ResolveError> {
	if name.contains('/') {
		return probe(PathBuf::from(name));
	}
	let mut found_non_exec = false;
	if let Some(paths) = env::var_os("PATH") {
		for dir in env::split_paths(&paths) {
			match probe(dir.join(name)) {
				Ok(path) => return Ok(path),
				Err(ResolveError::NotExecutable) => found_non_exec = true,
				Err(ResolveError::NotFound) => {}
			}
		}
	}
	if found_non_exec {
		Err(ResolveError::NotExecutable)
	} else {
		Err(ResolveError::NotFound)
	}
}

fn probe(path: PathBuf) -> result::Result<CString, ResolveError> {
	use std::os::unix::ffi::OsStringExt;

	let cpath = match CString::new(path.into_os_string().into_vec()) {
		Ok(cpath) => cpath,
		Err(_) => return Err(ResolveError::NotFound),
	};
	if unsafe { access(cpath.as_ptr(), F_OK) } == -1 {
		return Err(ResolveError::NotFound);
	}
	if unsafe { access(cpath.as_ptr(), X_OK) } == -1 {
		return Err(ResolveError::NotExecutable);
	}
	Ok(cpath)
}

/// Duplicate `oldfd` onto the standard slot `newfd` in a freshly forked
/// child. Any failure here aborts the child alone.
fn redirect_fd(oldfd: c_int, newfd: c_int, errmsg: *const c_char) {
	unsafe {
		if oldfd == newfd {
			// The descriptor already occupies the standard slot; only
			// the close-on-exec flag must go, or exec would close it.
			let flags = fcntl(oldfd, F_GETFD);

			if flags == -1 {
				perror(errmsg);
				_exit(EXIT_FAILURE);
			}

			if flags & FD_CLOEXEC != 0 {
				if fcntl(oldfd, F_SETFD, flags & !FD_CLOEXEC) != 0 {
					perror(errmsg);
					_exit(EXIT_FAILURE);
				}
			}
		} else {
			if dup2(oldfd, newfd) == -1 {
				perror(errmsg);
				_exit(EXIT_FAILURE);
			}
			close(oldfd);
		}
	}
}

fn make_argv(words: &[String]) -> result::Result<(Vec<CString>, Vec<*const c_char>), std::ffi::NulError> {
	let mut argv = Vec::with_capacity(words.len());
	for word in words {
		argv.push(CString::new(word.as_str())?);
	}
	let mut ptrs: Vec<*const c_char> = argv.iter().map(|arg| arg.as_ptr()).collect();
	ptrs.push(ptr::null());
	Ok((argv, ptrs))
}

/// A forked pipeline stage, to be reaped by [wait()](struct.ChildHandle.html#method.wait).
pub struct ChildHandle {
	pid: pid_t,
	stage: usize,
}

impl ChildHandle {
	pub fn pid(&self) -> pid_t {
		self.pid
	}

	pub fn stage(&self) -> usize {
		self.stage
	}

	/// Reap the child and collapse its termination into one raw status:
	/// the exit code for a normal exit, `128 + signo` when it was killed
	/// by a signal.
	pub fn wait(&mut self) -> Result<c_int> {
		let mut status: c_int = -1;
		loop {
			if unsafe { waitpid(self.pid, &mut status, 0) } == -1 {
				if unsafe { *__errno_location() } == EINTR {
					continue;
				}
				return os_err!("waitpid");
			}
			break;
		}
		self.pid = -1;

		if libc::WIFEXITED(status) {
			Ok(libc::WEXITSTATUS(status))
		} else if libc::WIFSIGNALED(status) {
			Ok(128 + libc::WTERMSIG(status))
		} else {
			// stopped/continued cannot be reported without WUNTRACED
			Ok(status)
		}
	}
}

/// Fork one pipeline stage, rewiring `stdin_fd` and `stdout_fd` onto its
/// standard slots.
///
/// Everything else the child inherited carries `O_CLOEXEC` and vanishes
/// at exec. Exec failures stay inside the child: it reports to stderr
/// and exits with the reserved status (127 not found, 126 found but not
/// executable), never returning to shared code paths.
pub fn launch(stage: usize, command: &str, stdin_fd: c_int, stdout_fd: c_int) -> Result<ChildHandle> {
	let words = split(command);
	if words.is_empty() {
		return Err(Error::EmptyCommand(stage));
	}

	let pid = unsafe { fork() };
	if pid == -1 {
		return os_err!("fork");
	}
	if pid == 0 {
		exec_stage(&words, stdin_fd, stdout_fd);
	}

	Ok(ChildHandle { pid, stage })
}

fn exec_stage(words: &[String], stdin_fd: c_int, stdout_fd: c_int) -> ! {
	redirect_fd(stdin_fd, STDIN_FILENO, cstr!(b"sluice: redirecting stdin\0"));
	redirect_fd(stdout_fd, STDOUT_FILENO, cstr!(b"sluice: redirecting stdout\0"));

	let path = match resolve(&words[0]) {
		Ok(path) => path,
		Err(err) => {
			let _ = writeln!(io::stderr(), "sluice: {}: {}", words[0], err);
			unsafe { _exit(err.status()) }
		}
	};

	let (argv, argv_ptrs) = match make_argv(words) {
		Ok(argv) => argv,
		Err(err) => {
			let _ = writeln!(io::stderr(), "sluice: {}: {}", words[0], err);
			unsafe { _exit(EXIT_FAILURE) }
		}
	};

	unsafe { execv(path.as_ptr(), argv_ptrs.as_ptr()); }

	// only reached when execv itself refused
	let err = io::Error::last_os_error();
	let _ = writeln!(io::stderr(), "sluice: {}: {}", words[0], err);
	let status = if err.raw_os_error() == Some(EACCES) { 126 } else { 127 };
	drop(argv);
	unsafe { _exit(status) }
}

/// Where the head of the pipeline reads from.
#[derive(Debug, Clone)]
pub enum Input {
	/// Redirect from this file.
	File(String),

	/// Interactive heredoc terminated by this sentinel line.
	Heredoc(String),
}

/// Immutable description of one pipeline run.
#[derive(Debug)]
pub struct PipelineSpec {
	input: Input,
	commands: Vec<String>,
	output: String,
	append: bool,
}

impl PipelineSpec {
	/// Build and validate a spec. Heredoc input forces append-mode
	/// output, matching the convention that heredoc pipelines accumulate
	/// output across repeated invocations.
	pub fn new(input: Input, commands: Vec<String>, output: &str) -> Result<Self> {
		if commands.is_empty() {
			return Err(Error::NoCommands);
		}
		for (stage, command) in commands.iter().enumerate() {
			if command.split_whitespace().next().is_none() {
				return Err(Error::EmptyCommand(stage));
			}
		}
		let append = match input {
			Input::Heredoc(_) => true,
			Input::File(_) => false,
		};
		Ok(PipelineSpec { input, commands, output: output.to_string(), append })
	}

	pub fn input(&self) -> &Input {
		&self.input
	}

	pub fn commands(&self) -> &[String] {
		&self.commands
	}

	pub fn output(&self) -> &str {
		&self.output
	}

	/// Whether the sink is opened in append mode.
	pub fn appends(&self) -> bool {
		self.append
	}
}

/// Run the whole pipeline and return its exit status.
///
/// The status is the termination status of the **last** stage, matching
/// the convention that a pipeline's status reflects its final command.
/// All children are reaped regardless, in stage order.
///
/// Head and tail descriptors are acquired and all pipes allocated before
/// the first fork, so every preflight and resource failure aborts with
/// no child spawned. A heredoc input reads lines from this process's
/// stdin until the sentinel; reaching end of input without it is a soft
/// warning and the partial buffer is delivered.
pub fn run(spec: &PipelineSpec) -> Result<c_int> {
	let head = match spec.input() {
		Input::File(path) => open_input(path)?,
		Input::Heredoc(sentinel) => {
			let stdin = io::stdin();
			let (buf, saw_sentinel) = read_heredoc(stdin.lock(), sentinel);
			if !saw_sentinel {
				let _ = writeln!(io::stderr(),
					"sluice: warning: here-document ended without sentinel `{}'", sentinel);
			}
			heredoc_fd(&buf)?
		}
	};
	let tail = open_output(&spec.output, spec.append)?;

	let n = spec.commands.len();
	let chain = build_chain(n)?;

	let mut children: Vec<ChildHandle> = Vec::with_capacity(n);
	for (i, command) in spec.commands.iter().enumerate() {
		let stdin_fd = if i == 0 { head.raw() } else { chain[i - 1].read_end() };
		let stdout_fd = if i == n - 1 { tail.raw() } else { chain[i].write_end() };
		match launch(i, command, stdin_fd, stdout_fd) {
			Ok(child) => children.push(child),
			Err(err) => {
				abort_spawned(&mut children);
				return Err(err);
			}
		}
	}

	// The parent never reads or writes pipeline data itself. Anything it
	// kept open here would hold some reader's end-of-stream hostage.
	drop(chain);
	drop(head);
	drop(tail);

	let mut status = 0;
	for mut child in children {
		status = child.wait()?;
	}
	Ok(status)
}

fn abort_spawned(children: &mut Vec<ChildHandle>) {
	for child in children.iter() {
		unsafe { kill(child.pid, SIGTERM); }
	}
	for mut child in children.drain(..) {
		let _ = child.wait();
	}
}
