pub mod commit;
pub mod consistency;
pub mod ctz_list;
pub mod dir;
pub mod file;
pub mod mdir;
pub mod path_resolver;
pub mod registry;
pub mod traverse;
