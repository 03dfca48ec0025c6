pub mod job_loader;

pub use job_loader::{load_all_job_files, load_job_file, JobFile};
