pub mod config;
pub mod decrypt;
pub mod error;
pub mod fetch;
pub mod loader;
pub mod merge;
pub mod orchestrator;
pub mod playlist;
pub mod progress;
pub mod segment;
pub mod task;
pub mod util;

pub use config::DownloadConfig;
pub use error::{ErrorKind, KaoriError, KaoriResult};
pub use loader::TaskList;
pub use orchestrator::TaskOrchestrator;
pub use playlist::{M3u8PlaylistResolver, PlaylistResolver, ResolvedPlaylist};
pub use progress::{ProgressAggregator, ProgressPhase, ProgressSummary, TaskSnapshot};
pub use task::{FailurePhase, TaskFailure, TaskRequest, TaskResult};
pub use util::http::HttpClient;

// ┌──────────────┐  segments   ┌──────────────────┐  fetch   ┌────────────────┐
// │   Playlist   ├─────────────►                  ├──────────►                │
// │   Resolver   │  + key info │ TaskOrchestrator │          │ SegmentFetcher ├──┐ get_key
// └──────────────┘             │                  ◄──────────┤                │  │ decrypt
//                              │  [outer permits] │   done   └────────────────┘  ▼
// ┌──────────────┐  per task   │  [inner permits] │                      ┌──────────────┐
// │   Progress   ◄─────────────┤                  │                      │ CryptoEngine │
// │  Aggregator  │             └────────┬─────────┘                      └──────────────┘
// └──────────────┘                      │ merge (index order)
//                              ┌────────▼─────────┐
//                              │ MergeCoordinator │ workspace: {temp}/merge_workspaces/{task}_{rand}
//                              │  muxer | concat  │
//                              └──────────────────┘
