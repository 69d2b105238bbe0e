pub mod transfer_manager;
