// Child process management: phase workers and the supervised backend
pub mod python_worker;
pub mod supervisor;
pub mod tree;

pub use python_worker::{get_python_path, get_workers_dir, WorkerMessage, WorkerRuntime};
pub use supervisor::{pick_port, RestartPolicy, Supervisor, SupervisorConfig, SupervisorState};
pub use tree::kill_process_tree;
