mod failover_case1;
mod replication_case1;
