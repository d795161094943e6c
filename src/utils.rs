pub mod bitflags;
pub mod clonecell;
pub mod compat;
pub mod copyhashmap;
pub mod errorfmt;
pub mod mmap;
pub mod numcell;
pub mod oserror;
pub mod ptr_ext;
