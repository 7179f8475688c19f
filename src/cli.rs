//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};

use canvas_dl::{CollisionPolicy, ContentSource, MergeScope};

/// Download and organize Canvas course files.
///
/// Mirrors a course's folders (or modules) into a local directory, optionally
/// keeping only some file types and merging the PDFs of each folder.
#[derive(Parser, Debug)]
#[command(name = "canvas-dl")]
#[command(author, version, about)]
pub struct Cli {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Canvas API root (default: $API_URL, then config `api_url`, then the UvA instance)
    #[arg(long, global = true)]
    pub api_url: Option<String>,

    /// Access token (default: $ACCESS_TOKEN, $CANVAS_DL_TOKEN, then config `access_token`)
    #[arg(long, global = true)]
    pub token: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download the files of one course
    Download(DownloadArgs),
    /// List the courses visible to the token
    Courses(CoursesArgs),
    /// Print the effective configuration (token masked)
    Config,
}

#[derive(ClapArgs, Debug)]
pub struct CoursesArgs {
    /// Only list published courses
    #[arg(long)]
    pub published: bool,
}

#[derive(ClapArgs, Debug)]
pub struct DownloadArgs {
    /// Numeric Canvas course id
    pub course_id: u64,

    /// Directory the course folder is created in
    #[arg(short, long)]
    pub dest: Option<PathBuf>,

    /// Only download these extensions (comma separated, repeatable)
    #[arg(long, value_delimiter = ',')]
    pub only: Vec<String>,

    /// Only download files whose name matches this shell glob
    #[arg(long)]
    pub name: Option<String>,

    /// Only download files whose name contains a match for this regex
    #[arg(long)]
    pub regex: Option<String>,

    /// Maximum concurrent downloads (1-64)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=64))]
    pub concurrency: Option<u8>,

    /// Maximum attempts per request (1-10)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u8).range(1..=10))]
    pub max_retries: Option<u8>,

    /// Do not merge PDFs
    #[arg(long)]
    pub no_merge: bool,

    /// Which merged PDFs to produce
    #[arg(long, value_enum)]
    pub merge_scope: Option<MergeScopeArg>,

    /// Delete the original PDFs after a successful merge
    #[arg(long)]
    pub replace_originals: bool,

    /// What to do when a different file already exists at the target path
    #[arg(long, value_enum)]
    pub collision: Option<CollisionArg>,

    /// Mirror the course's Files area or its modules
    #[arg(long, value_enum, default_value_t = SourceArg::Folders)]
    pub source: SourceArg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MergeScopeArg {
    Folder,
    Course,
    Both,
}

impl From<MergeScopeArg> for MergeScope {
    fn from(value: MergeScopeArg) -> Self {
        match value {
            MergeScopeArg::Folder => Self::Folder,
            MergeScopeArg::Course => Self::Course,
            MergeScopeArg::Both => Self::Both,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CollisionArg {
    Suffix,
    Overwrite,
    Skip,
}

impl From<CollisionArg> for CollisionPolicy {
    fn from(value: CollisionArg) -> Self {
        match value {
            CollisionArg::Suffix => Self::Suffix,
            CollisionArg::Overwrite => Self::Overwrite,
            CollisionArg::Skip => Self::Skip,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SourceArg {
    Folders,
    Modules,
}

impl From<SourceArg> for ContentSource {
    fn from(value: SourceArg) -> Self {
        match value {
            SourceArg::Folders => Self::Folders,
            SourceArg::Modules => Self::Modules,
        }
    }
}
