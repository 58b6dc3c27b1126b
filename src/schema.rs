// Diesel table definitions matching store::migrations.
// PRIMARY KEY columns are not nullable.

diesel::table! {
    jobs (id) {
        id -> BigInt,
        description -> Text,
        status -> Text,
        error -> Nullable<Text>,
        seeding_process_id -> Nullable<Text>,
        seeding_check_time -> Nullable<BigInt>,
        seeding_fail_time -> Nullable<BigInt>,
        seeding_fail_count -> Integer,
        last_seeding_ms -> Nullable<BigInt>,
        run_started_ms -> Nullable<BigInt>,
    }
}

diesel::table! {
    queue_entries (job_id, doc_hash) {
        job_id -> BigInt,
        doc_hash -> Text,
        doc_id -> Text,
        status -> Text,
        priority -> Nullable<Double>,
        needs_priority -> Bool,
        check_time -> BigInt,
        fail_time -> Nullable<BigInt>,
        fail_count -> Integer,
        origination_time -> Nullable<BigInt>,
        processed_before -> Bool,
        seed_status -> Text,
        seeding_process_id -> Nullable<Text>,
        process_id -> Nullable<Text>,
        last_version -> Nullable<Text>,
        last_error -> Nullable<Text>,
    }
}

diesel::table! {
    carrydown (job_id, parent_hash, child_hash, data_name, value_hash) {
        job_id -> BigInt,
        parent_hash -> Text,
        child_hash -> Text,
        data_name -> Text,
        value_hash -> Text,
        value -> Text,
        state -> Text,
        process_id -> Nullable<Text>,
    }
}

diesel::table! {
    intrinsic_links (job_id, link_type, parent_hash, child_hash) {
        job_id -> BigInt,
        link_type -> Text,
        parent_hash -> Text,
        child_hash -> Text,
        state -> Text,
        process_id -> Nullable<Text>,
    }
}

diesel::table! {
    hopcounts (job_id, link_type, doc_hash) {
        job_id -> BigInt,
        link_type -> Text,
        doc_hash -> Text,
        distance -> Integer,
    }
}

diesel::table! {
    bin_counters (connector_id, bin_name) {
        connector_id -> Text,
        bin_name -> Text,
        counter -> Double,
    }
}

diesel::table! {
    scheduler_leases (name) {
        name -> Text,
        process_id -> Text,
        holder_id -> Text,
        acquired_ms -> BigInt,
        heartbeat_ms -> BigInt,
        expires_ms -> BigInt,
    }
}

diesel::table! {
    scheduler_values (name) {
        name -> Text,
        value -> Double,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    jobs,
    queue_entries,
    carrydown,
    intrinsic_links,
    hopcounts,
    bin_counters,
    scheduler_leases,
    scheduler_values,
);
