use crate::registry::Accounting;
use crate::request::{BufferRequest, ItemAction, ItemRequest, JobInfo};
use crate::{GroupId, JobId, Priority, Timestamp, UserId};

pub struct JobBuilder {
    info: JobInfo,
}

impl JobBuilder {
    pub fn new<T: Into<JobId>>(id: T) -> JobBuilder {
        JobBuilder {
            info: JobInfo {
                job_id: id.into(),
                user_id: UserId::new(1000),
                group_id: GroupId::new(100),
                accounting: Accounting {
                    account: "proj".to_string(),
                    partition: "batch".to_string(),
                    qos: "normal".to_string(),
                },
                priority: 0,
                start_time: None,
                end_time: None,
                reservation: None,
                request: BufferRequest::default(),
            },
        }
    }

    pub fn user(mut self, user_id: u32) -> JobBuilder {
        self.info.user_id = UserId::new(user_id);
        self
    }

    pub fn priority(mut self, priority: Priority) -> JobBuilder {
        self.info.priority = priority;
        self
    }

    pub fn capacity(mut self, size: u64) -> JobBuilder {
        self.info.request.capacity = size;
        self
    }

    pub fn pool(mut self, pool: &str) -> JobBuilder {
        self.info.request.pool = Some(pool.to_string());
        self
    }

    pub fn swap(mut self, per_node: u64, nodes: u32) -> JobBuilder {
        self.info.request.swap_per_node = per_node;
        self.info.request.node_count = nodes;
        self
    }

    pub fn start_at(mut self, time: Timestamp) -> JobBuilder {
        self.info.start_time = Some(time);
        self
    }

    pub fn end_at(mut self, time: Timestamp) -> JobBuilder {
        self.info.end_time = Some(time);
        self
    }

    pub fn reservation(mut self, name: &str) -> JobBuilder {
        self.info.reservation = Some(name.to_string());
        self
    }

    pub fn create(mut self, name: &str, size: u64) -> JobBuilder {
        self.info.request.items.push(ItemRequest {
            name: name.to_string(),
            action: ItemAction::Create {
                size,
                pool: None,
                access: Some("striped".to_string()),
                buffer_type: Some("scratch".to_string()),
            },
        });
        self
    }

    pub fn destroy(mut self, name: &str) -> JobBuilder {
        self.info.request.items.push(ItemRequest {
            name: name.to_string(),
            action: ItemAction::Destroy { hurry: false },
        });
        self
    }

    pub fn use_buffer(mut self, name: &str) -> JobBuilder {
        self.info.request.items.push(ItemRequest {
            name: name.to_string(),
            action: ItemAction::Use,
        });
        self
    }

    pub fn build(self) -> JobInfo {
        self.info
    }
}
