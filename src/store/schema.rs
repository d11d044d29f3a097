diesel::table! {
    audits (id) {
        id -> Int4,
        framework_id -> Nullable<Int4>,
        policy_id -> Nullable<Int4>,
        subpolicy_id -> Nullable<Int4>,
        title -> Varchar,
        objective -> Nullable<Text>,
        scope -> Nullable<Text>,
        status -> Nullable<Varchar>,
    }
}

diesel::table! {
    frameworks (id) {
        id -> Int4,
        name -> Varchar,
    }
}

diesel::table! {
    policies (id) {
        id -> Int4,
        framework_id -> Int4,
        name -> Varchar,
        description -> Text,
        status -> Nullable<Varchar>,
    }
}

diesel::table! {
    subpolicies (id) {
        id -> Int4,
        policy_id -> Int4,
        name -> Varchar,
        description -> Text,
        status -> Nullable<Varchar>,
    }
}

diesel::table! {
    compliances (id) {
        id -> Int4,
        subpolicy_id -> Int4,
        policy_id -> Nullable<Int4>,
        title -> Varchar,
        description -> Text,
        status -> Nullable<Varchar>,
    }
}

diesel::table! {
    audit_findings (id) {
        id -> Int8,
        audit_id -> Int4,
        compliance_id -> Nullable<Int4>,
        check_status -> Nullable<Varchar>,
        comment -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    incidents (id) {
        id -> Int8,
        title -> Varchar,
        description -> Nullable<Text>,
        status -> Nullable<Varchar>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    risks (id) {
        id -> Int8,
        title -> Varchar,
        description -> Nullable<Text>,
        category -> Nullable<Varchar>,
        status -> Nullable<Varchar>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    events (id) {
        id -> Int8,
        title -> Varchar,
        description -> Nullable<Text>,
        occurred_at -> Timestamptz,
    }
}

diesel::table! {
    uploaded_documents (id) {
        id -> Int8,
        framework_id -> Int4,
        object_key -> Nullable<Varchar>,
        stored_name -> Nullable<Varchar>,
        upload_ids -> Array<Text>,
        title -> Varchar,
        summary -> Nullable<Text>,
        metadata -> Nullable<Jsonb>,
        upload_status -> Varchar,
    }
}

diesel::table! {
    evidence_records (id) {
        id -> Int8,
        audit_id -> Int4,
        kind -> Varchar,
        provenance -> Varchar,
        policy_id -> Nullable<Int4>,
        subpolicy_id -> Nullable<Int4>,
        compliance_id -> Nullable<Int4>,
        status -> Varchar,
        analysis_snapshot -> Nullable<Jsonb>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    checklist_entries (id) {
        id -> Int8,
        compliance_id -> Int4,
        subpolicy_id -> Int4,
        policy_id -> Int4,
        framework_id -> Int4,
        last_verified_at -> Timestamptz,
        complied -> Varchar,
        comment -> Nullable<Text>,
        observation_count -> Int4,
    }
}
