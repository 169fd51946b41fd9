use diesel::{allow_tables_to_appear_in_same_query, joinable, table};

table! {
    use diesel::sql_types::*;
    use crate::enums::EventStatusMapping;

    events (id) {
        id -> Text,
        name -> Text,
        start_time -> TimestamptzSqlite,
        categories -> Text,
        status -> EventStatusMapping,
        created_at -> TimestamptzSqlite,
        updated_at -> TimestamptzSqlite,
    }
}

table! {
    use diesel::sql_types::*;
    use crate::enums::JobStatusMapping;

    print_jobs (event_id) {
        event_id -> Text,
        event_name -> Text,
        scheduled_time -> TimestamptzSqlite,
        status -> JobStatusMapping,
        retry_count -> Integer,
        error_message -> Nullable<Text>,
        created_at -> TimestamptzSqlite,
        updated_at -> TimestamptzSqlite,
    }
}

joinable!(print_jobs -> events (event_id));
allow_tables_to_appear_in_same_query!(events, print_jobs);
