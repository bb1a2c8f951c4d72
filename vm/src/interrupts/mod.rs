pub mod page_fault;

pub use page_fault::{
    handle_page_fault, page_fault, FaultDisposition, FaultResolution, PageFault,
    PageFaultError, PageFaultErrorCode,
};
