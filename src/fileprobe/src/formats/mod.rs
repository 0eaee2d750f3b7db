pub mod pe;
pub mod elf;
pub mod lnk;
pub mod sevenzip;
pub mod rar;
pub mod tar;
pub mod zip;
pub mod iso9660;
pub mod ebml;
pub mod pcap;
pub mod sqlite;
