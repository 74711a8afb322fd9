pub mod collab;
