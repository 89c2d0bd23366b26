//! Integration tests for sceneflow

mod test_utils;

mod in_mem_database;
mod job_batcher;
mod rpc_server;
mod trace_propagation;
mod track_atom_read;
